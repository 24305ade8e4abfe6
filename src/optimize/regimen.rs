use serde::{Deserialize, Serialize};

use crate::data::{Dose, DosingRegimen};
use crate::error::ConfigurationError;

/// A regimen setting that is either held fixed or searched within bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Knob {
    Fixed(f64),
    Free { initial: f64, lower: f64, upper: f64 },
}

impl Knob {
    pub fn is_free(&self) -> bool {
        matches!(self, Knob::Free { .. })
    }

    fn validate(&self, what: &str) -> Result<(), ConfigurationError> {
        let valid = match *self {
            Knob::Fixed(value) => value.is_finite(),
            Knob::Free {
                initial,
                lower,
                upper,
            } => lower.is_finite() && upper.is_finite() && lower <= initial && initial <= upper && lower < upper,
        };
        if valid {
            Ok(())
        } else {
            Err(ConfigurationError::MalformedRegimen(format!(
                "invalid {} {:?}",
                what, self
            )))
        }
    }
}

/// When doses are given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    Fixed(Vec<f64>),
    Periodic {
        start: f64,
        n_doses: usize,
        interval: Knob,
    },
}

/// How much every dose contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Amounts {
    /// One amount for every dose
    Shared(Knob),
    /// One amount per dose, in schedule order
    PerDose(Vec<Knob>),
}

/// A family of dosing regimens indexed by its free knobs
///
/// The free knobs are ordered as the dosing interval (when free) followed by the amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimenTemplate {
    pub schedule: Schedule,
    pub amounts: Amounts,
    /// Infusion duration; zero gives boluses
    pub duration: f64,
    pub input: usize,
}

impl RegimenTemplate {
    pub fn n_doses(&self) -> usize {
        match &self.schedule {
            Schedule::Fixed(times) => times.len(),
            Schedule::Periodic { n_doses, .. } => *n_doses,
        }
    }

    fn knobs(&self) -> Vec<Knob> {
        let mut knobs = Vec::new();
        if let Schedule::Periodic { interval, .. } = &self.schedule {
            knobs.push(*interval);
        }
        match &self.amounts {
            Amounts::Shared(knob) => knobs.push(*knob),
            Amounts::PerDose(amounts) => knobs.extend(amounts.iter().copied()),
        }
        knobs
    }

    fn free_knobs(&self) -> Vec<Knob> {
        self.knobs().into_iter().filter(Knob::is_free).collect()
    }

    pub fn n_free(&self) -> usize {
        self.free_knobs().len()
    }

    /// Initial values of the free knobs
    pub fn initial(&self) -> Vec<f64> {
        self.free_knobs()
            .iter()
            .filter_map(|knob| match *knob {
                Knob::Free { initial, .. } => Some(initial),
                Knob::Fixed(_) => None,
            })
            .collect()
    }

    /// `(lower, upper)` of the free knobs
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.free_knobs()
            .iter()
            .filter_map(|knob| match *knob {
                Knob::Free { lower, upper, .. } => Some((lower, upper)),
                Knob::Fixed(_) => None,
            })
            .collect()
    }

    pub fn in_bounds(&self, x: &[f64]) -> bool {
        x.len() == self.n_free()
            && self
                .bounds()
                .iter()
                .zip(x)
                .all(|((lower, upper), v)| *lower <= *v && *v <= *upper)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.n_doses() == 0 {
            return Err(ConfigurationError::MalformedRegimen(
                "the template has no doses".to_string(),
            ));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(ConfigurationError::MalformedRegimen(format!(
                "invalid dose duration {}",
                self.duration
            )));
        }
        match &self.schedule {
            Schedule::Fixed(times) => {
                if let Some(t) = times.iter().find(|t| !t.is_finite() || **t < 0.0) {
                    return Err(ConfigurationError::MalformedRegimen(format!(
                        "invalid dose time {}",
                        t
                    )));
                }
            }
            Schedule::Periodic {
                start, interval, ..
            } => {
                if !start.is_finite() || *start < 0.0 {
                    return Err(ConfigurationError::MalformedRegimen(format!(
                        "invalid start time {}",
                        start
                    )));
                }
                interval.validate("dosing interval")?;
            }
        }
        if let Amounts::PerDose(amounts) = &self.amounts {
            if amounts.len() != self.n_doses() {
                return Err(ConfigurationError::MalformedRegimen(format!(
                    "{} amounts for {} doses",
                    amounts.len(),
                    self.n_doses()
                )));
            }
        }
        for knob in self.knobs() {
            knob.validate("knob")?;
        }
        Ok(())
    }

    /// The regimen for values `x` of the free knobs
    pub fn build(&self, x: &[f64]) -> Result<DosingRegimen, ConfigurationError> {
        if x.len() != self.n_free() {
            return Err(ConfigurationError::ParameterCount {
                context: "regimen template".to_string(),
                expected: self.n_free(),
                found: x.len(),
            });
        }
        let mut free = x.iter().copied();
        let mut resolve = |knob: &Knob| match *knob {
            Knob::Fixed(value) => value,
            Knob::Free { .. } => free.next().unwrap_or(f64::NAN),
        };

        let times: Vec<f64> = match &self.schedule {
            Schedule::Fixed(times) => times.clone(),
            Schedule::Periodic {
                start,
                n_doses,
                interval,
            } => {
                let interval = resolve(interval);
                if interval.is_nan() || interval <= 0.0 {
                    return Err(ConfigurationError::MalformedRegimen(format!(
                        "dosing interval must be positive, got {}",
                        interval
                    )));
                }
                (0..*n_doses).map(|i| start + i as f64 * interval).collect()
            }
        };
        let amounts: Vec<f64> = match &self.amounts {
            Amounts::Shared(knob) => vec![resolve(knob); times.len()],
            Amounts::PerDose(knobs) => knobs.iter().map(&mut resolve).collect(),
        };

        let doses = times
            .into_iter()
            .zip(amounts)
            .map(|(time, amount)| {
                if self.duration > 0.0 {
                    Dose::infusion(time, amount, self.input, self.duration)
                } else {
                    Dose::bolus(time, amount, self.input)
                }
            })
            .collect();
        DosingRegimen::from_doses(doses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> RegimenTemplate {
        RegimenTemplate {
            schedule: Schedule::Periodic {
                start: 0.0,
                n_doses: 3,
                interval: Knob::Free {
                    initial: 12.0,
                    lower: 6.0,
                    upper: 24.0,
                },
            },
            amounts: Amounts::Shared(Knob::Free {
                initial: 100.0,
                lower: 0.0,
                upper: 500.0,
            }),
            duration: 0.0,
            input: 0,
        }
    }

    #[test]
    fn knobs_are_ordered_interval_then_amounts() {
        let template = template();
        template.validate().unwrap();
        assert_eq!(template.initial(), vec![12.0, 100.0]);
        assert_eq!(template.bounds(), vec![(6.0, 24.0), (0.0, 500.0)]);
        let regimen = template.build(&[8.0, 50.0]).unwrap();
        let times: Vec<f64> = regimen.iter().map(|d| d.time()).collect();
        assert_eq!(times, vec![0.0, 8.0, 16.0]);
        assert_eq!(regimen.total_amount(), 150.0);
    }

    #[test]
    fn per_dose_amounts_with_fixed_times() {
        let template = RegimenTemplate {
            schedule: Schedule::Fixed(vec![0.0, 24.0]),
            amounts: Amounts::PerDose(vec![
                Knob::Fixed(200.0),
                Knob::Free {
                    initial: 100.0,
                    lower: 10.0,
                    upper: 300.0,
                },
            ]),
            duration: 1.0,
            input: 0,
        };
        template.validate().unwrap();
        assert_eq!(template.n_free(), 1);
        let regimen = template.build(&[75.0]).unwrap();
        assert_eq!(regimen.doses()[0].amount(), 200.0);
        assert_eq!(regimen.doses()[1].amount(), 75.0);
        assert!(!regimen.doses()[1].is_bolus());
        assert!(!template.in_bounds(&[400.0]));
    }

    #[test]
    fn malformed_templates() {
        let mut template = template();
        template.amounts = Amounts::PerDose(vec![Knob::Fixed(1.0)]);
        assert!(template.validate().is_err());
        assert!(self::template().build(&[1.0]).is_err());
    }
}
