use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::event::Dose;
use crate::error::ConfigurationError;

/// An ordered sequence of [Dose]s
///
/// Doses are kept sorted by start time. Inserting a dose places it after every dose with the
/// same or an earlier start time, so doses given at the same time keep their insertion order.
/// Doses that overlap on the same compartment are additive.
///
/// # Examples
///
/// ```
/// use pkpdinfer::*;
///
/// let mut regimen = DosingRegimen::new();
/// regimen.add(Dose::bolus(12.0, 50.0, 0)).unwrap();
/// regimen.add(Dose::bolus(0.0, 100.0, 0)).unwrap();
/// assert_eq!(regimen.doses()[0].time(), 0.0);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DosingRegimen {
    doses: Vec<Dose>,
}

impl DosingRegimen {
    /// An empty regimen, equivalent to no treatment
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a regimen from unsorted doses
    pub fn from_doses(doses: Vec<Dose>) -> Result<Self, ConfigurationError> {
        let mut regimen = Self::new();
        for dose in doses {
            regimen.add(dose)?;
        }
        Ok(regimen)
    }

    /// Repeated administration of the same dose
    ///
    /// A `duration` of zero gives boluses, a positive duration gives infusions.
    ///
    /// # Arguments
    ///
    /// * `amount` - Amount administered at each dose
    /// * `start` - Time of the first dose
    /// * `duration` - Duration of each administration
    /// * `period` - Time between the starts of two consecutive doses
    /// * `n_doses` - Number of administrations
    /// * `input` - The compartment receiving the doses
    pub fn periodic(
        amount: f64,
        start: f64,
        duration: f64,
        period: f64,
        n_doses: usize,
        input: usize,
    ) -> Result<Self, ConfigurationError> {
        if n_doses > 1 && !(period.is_finite() && period > 0.0) {
            return Err(ConfigurationError::MalformedRegimen(format!(
                "dosing period must be finite and positive, got {}",
                period
            )));
        }
        let mut regimen = Self::new();
        for k in 0..n_doses {
            let time = start + k as f64 * period;
            let dose = if duration > 0.0 {
                Dose::infusion(time, amount, input, duration)
            } else {
                Dose::bolus(time, amount, input)
            };
            regimen.add(dose)?;
        }
        Ok(regimen)
    }

    /// Insert a dose, keeping the regimen sorted by start time
    pub fn add(&mut self, dose: Dose) -> Result<(), ConfigurationError> {
        dose.validate()?;
        if self
            .doses
            .iter()
            .any(|other| other.time() == dose.time() && other.input() == dose.input())
        {
            tracing::warn!(
                "Simultaneous doses in compartment {} at t = {}, amounts are added",
                dose.input(),
                dose.time()
            );
        }
        let position = self.doses.partition_point(|other| other.time() <= dose.time());
        self.doses.insert(position, dose);
        Ok(())
    }

    pub fn doses(&self) -> &[Dose] {
        &self.doses
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dose> {
        self.doses.iter()
    }

    pub fn len(&self) -> usize {
        self.doses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doses.is_empty()
    }

    /// Doses starting at or before `final_time`
    pub fn events_until(&self, final_time: f64) -> Vec<Dose> {
        self.doses
            .iter()
            .take_while(|dose| dose.time() <= final_time)
            .copied()
            .collect()
    }

    /// Sum of all administered amounts (before bioavailability)
    pub fn total_amount(&self) -> f64 {
        self.doses.iter().map(|dose| dose.amount()).sum()
    }

    /// Pairs of indices of doses given at the same time into the same compartment
    pub fn simultaneous_events(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..self.doses.len() {
            for j in (i + 1)..self.doses.len() {
                if self.doses[j].time() != self.doses[i].time() {
                    break;
                }
                if self.doses[j].input() == self.doses[i].input() {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Largest compartment index referenced by any dose
    pub(crate) fn max_input(&self) -> Option<usize> {
        self.doses.iter().map(|dose| dose.input()).max()
    }
}

impl<'a> IntoIterator for &'a DosingRegimen {
    type Item = &'a Dose;
    type IntoIter = std::slice::Iter<'a, Dose>;
    fn into_iter(self) -> Self::IntoIter {
        self.doses.iter()
    }
}

impl fmt::Display for DosingRegimen {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Dosing regimen with {} doses", self.doses.len())?;
        for dose in &self.doses {
            writeln!(f, "  {}", dose)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_keeps_order() {
        let regimen = DosingRegimen::from_doses(vec![
            Dose::bolus(5.0, 1.0, 0),
            Dose::bolus(1.0, 2.0, 0),
            Dose::infusion(3.0, 3.0, 1, 1.0),
            Dose::bolus(1.0, 4.0, 1),
        ])
        .unwrap();
        let times: Vec<f64> = regimen.iter().map(|d| d.time()).collect();
        assert_eq!(times, vec![1.0, 1.0, 3.0, 5.0]);
        // Stable for equal times
        assert_eq!(regimen.doses()[0].amount(), 2.0);
        assert_eq!(regimen.doses()[1].amount(), 4.0);
    }

    #[test]
    fn malformed_doses_are_rejected() {
        let mut regimen = DosingRegimen::new();
        assert!(regimen.add(Dose::bolus(-0.5, 1.0, 0)).is_err());
        assert!(regimen.add(Dose::infusion(0.0, 1.0, 0, -1.0)).is_err());
        assert!(regimen.is_empty());
    }

    #[test]
    fn periodic_regimen() {
        let regimen = DosingRegimen::periodic(100.0, 0.0, 0.0, 12.0, 4, 0).unwrap();
        assert_eq!(regimen.len(), 4);
        assert_eq!(regimen.doses()[3].time(), 36.0);
        assert!(regimen.iter().all(|d| d.is_bolus()));
        assert_eq!(regimen.total_amount(), 400.0);
        assert_eq!(regimen.events_until(24.0).len(), 3);

        let infusions = DosingRegimen::periodic(10.0, 1.0, 2.0, 24.0, 2, 1).unwrap();
        assert!(infusions.iter().all(|d| !d.is_bolus()));
        assert!(DosingRegimen::periodic(10.0, 0.0, 0.0, 0.0, 3, 0).is_err());
    }

    #[test]
    fn simultaneous_events_are_flagged() {
        let regimen = DosingRegimen::from_doses(vec![
            Dose::bolus(2.0, 1.0, 0),
            Dose::bolus(2.0, 1.0, 1),
            Dose::infusion(2.0, 1.0, 0, 3.0),
        ])
        .unwrap();
        assert_eq!(regimen.simultaneous_events(), vec![(0, 2)]);
    }
}
