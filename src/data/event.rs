use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// A single administration of drug
///
/// Doses are either instantaneous ([Bolus]) or spread over a duration at a constant rate
/// ([Infusion]). The variant is the instantaneous/duration flag.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Dose {
    /// A bolus dose (instantaneous drug input)
    Bolus(Bolus),
    /// An infusion (continuous drug input over a duration)
    Infusion(Infusion),
}

impl Dose {
    pub fn bolus(time: f64, amount: f64, input: usize) -> Self {
        Dose::Bolus(Bolus::new(time, amount, input))
    }

    pub fn infusion(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Dose::Infusion(Infusion::new(time, amount, input, duration))
    }

    /// Start time of the administration
    pub fn time(&self) -> f64 {
        match self {
            Dose::Bolus(bolus) => bolus.time,
            Dose::Infusion(infusion) => infusion.time,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            Dose::Bolus(bolus) => bolus.amount,
            Dose::Infusion(infusion) => infusion.amount,
        }
    }

    /// The compartment (zero-indexed) receiving the dose
    pub fn input(&self) -> usize {
        match self {
            Dose::Bolus(bolus) => bolus.input,
            Dose::Infusion(infusion) => infusion.input,
        }
    }

    /// Duration of the administration, zero for boluses
    pub fn duration(&self) -> f64 {
        match self {
            Dose::Bolus(_) => 0.0,
            Dose::Infusion(infusion) => infusion.duration,
        }
    }

    pub fn is_bolus(&self) -> bool {
        matches!(self, Dose::Bolus(_))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        let time = self.time();
        if !time.is_finite() || time < 0.0 {
            return Err(ConfigurationError::MalformedRegimen(format!(
                "dose start time must be finite and non-negative, got {}",
                time
            )));
        }
        let amount = self.amount();
        if !amount.is_finite() || amount < 0.0 {
            return Err(ConfigurationError::MalformedRegimen(format!(
                "dose amount must be finite and non-negative, got {}",
                amount
            )));
        }
        if let Dose::Infusion(infusion) = self {
            if !infusion.duration.is_finite() || infusion.duration <= 0.0 {
                return Err(ConfigurationError::MalformedRegimen(format!(
                    "infusion duration must be finite and positive, got {}",
                    infusion.duration
                )));
            }
        }
        Ok(())
    }
}

/// Represents an instantaneous input of drug
///
/// A [Bolus] is a discrete amount of drug added to a specific compartment at a specific time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Bolus {
    time: f64,
    amount: f64,
    input: usize,
}

impl Bolus {
    /// Create a new bolus event
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the bolus dose
    /// * `amount` - Amount of drug administered
    /// * `input` - The compartment number (zero-indexed) receiving the dose
    pub fn new(time: f64, amount: f64, input: usize) -> Self {
        Bolus {
            time,
            amount,
            input,
        }
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn input(&self) -> usize {
        self.input
    }

    pub fn time(&self) -> f64 {
        self.time
    }
}

/// Represents a continuous dose of drug over time
///
/// An [Infusion] administers `amount` at the constant rate `amount / duration` over
/// `[time, time + duration)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Infusion {
    time: f64,
    amount: f64,
    input: usize,
    duration: f64,
}

impl Infusion {
    /// Create a new infusion event
    ///
    /// # Arguments
    ///
    /// * `time` - Start time of the infusion
    /// * `amount` - Total amount of drug to be administered
    /// * `input` - The compartment number (zero-indexed) receiving the dose
    /// * `duration` - Duration of the infusion in time units
    pub fn new(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Infusion {
            time,
            amount,
            input,
            duration,
        }
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn input(&self) -> usize {
        self.input
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Time at which the infusion stops
    pub fn end_time(&self) -> f64 {
        self.time + self.duration
    }

    /// Infusion rate (amount per unit time)
    pub fn rate(&self) -> f64 {
        self.amount / self.duration
    }
}

/// A measured value of one model output
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    time: f64,
    value: f64,
    outeq: usize,
}

impl Observation {
    /// Create a new observation
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the observation
    /// * `value` - Observed value (e.g., drug concentration)
    /// * `outeq` - Output equation number (zero-indexed) corresponding to this observation
    pub fn new(time: f64, value: f64, outeq: usize) -> Self {
        Observation { time, value, outeq }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn outeq(&self) -> usize {
        self.outeq
    }
}

impl fmt::Display for Dose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Dose::Bolus(bolus) => write!(
                f,
                "Bolus at time {:.2} with amount {:.2} in compartment {}",
                bolus.time, bolus.amount, bolus.input
            ),
            Dose::Infusion(infusion) => write!(
                f,
                "Infusion starting at {:.2} with amount {:.2} over {:.2} hours in compartment {}",
                infusion.time, infusion.amount, infusion.duration, infusion.input
            ),
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Observation at time {:.2}: {} (outeq {})",
            self.time, self.value, self.outeq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bolus_creation() {
        let dose = Dose::bolus(2.5, 100.0, 1);
        assert_eq!(dose.time(), 2.5);
        assert_eq!(dose.amount(), 100.0);
        assert_eq!(dose.input(), 1);
        assert_eq!(dose.duration(), 0.0);
        assert!(dose.is_bolus());
    }

    #[test]
    fn test_infusion_rate_and_end() {
        let infusion = Infusion::new(1.0, 200.0, 1, 2.5);
        assert_eq!(infusion.end_time(), 3.5);
        assert_eq!(infusion.rate(), 80.0);
    }

    #[test]
    fn test_validation() {
        assert!(Dose::bolus(0.0, 10.0, 0).validate().is_ok());
        assert!(Dose::bolus(-1.0, 10.0, 0).validate().is_err());
        assert!(Dose::bolus(1.0, f64::NAN, 0).validate().is_err());
        assert!(Dose::infusion(1.0, 10.0, 0, 0.0).validate().is_err());
        assert!(Dose::infusion(1.0, 10.0, 0, 2.0).validate().is_ok());
    }

    #[test]
    fn test_display() {
        let dose = Dose::infusion(1.0, 200.0, 0, 2.0);
        assert_eq!(
            dose.to_string(),
            "Infusion starting at 1.00 with amount 200.00 over 2.00 hours in compartment 0"
        );
    }
}
