use std::collections::BTreeMap;

use crate::data::*;
use crate::error::ConfigurationError;

pub trait SubjectBuilderExt {
    fn builder(id: impl Into<String>) -> SubjectBuilder;
}

impl SubjectBuilderExt for Subject {
    fn builder(id: impl Into<String>) -> SubjectBuilder {
        SubjectBuilder {
            id: id.into(),
            doses: Vec::new(),
            observations: Vec::new(),
            covariates: BTreeMap::new(),
            last: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LastEntry {
    Dose(Dose),
    Observation(Observation),
}

/// Fluent construction of a [Subject]
///
/// Validation is deferred to [SubjectBuilder::build].
#[derive(Debug, Clone)]
pub struct SubjectBuilder {
    id: String,
    doses: Vec<Dose>,
    observations: Vec<Observation>,
    covariates: BTreeMap<String, f64>,
    last: Option<LastEntry>,
}

impl SubjectBuilder {
    pub fn dose(mut self, dose: Dose) -> Self {
        self.doses.push(dose);
        self.last = Some(LastEntry::Dose(dose));
        self
    }

    pub fn bolus(self, time: f64, amount: f64, input: usize) -> Self {
        self.dose(Dose::bolus(time, amount, input))
    }

    pub fn infusion(self, time: f64, amount: f64, input: usize, duration: f64) -> Self {
        self.dose(Dose::infusion(time, amount, input, duration))
    }

    pub fn regimen(mut self, regimen: &DosingRegimen) -> Self {
        self.doses.extend(regimen.iter().copied());
        self.last = None;
        self
    }

    pub fn observation(mut self, time: f64, value: f64, outeq: usize) -> Self {
        let observation = Observation::new(time, value, outeq);
        self.observations.push(observation);
        self.last = Some(LastEntry::Observation(observation));
        self
    }

    pub fn covariate(mut self, name: impl Into<String>, value: f64) -> Self {
        self.covariates.insert(name.into(), value);
        self
    }

    /// Repeat the last dose or observation `n` times, shifted by `delta` each time
    pub fn repeat(mut self, n: usize, delta: f64) -> Self {
        let Some(last) = self.last else {
            return self;
        };
        for i in 1..=n {
            let shift = delta * i as f64;
            self = match last {
                LastEntry::Dose(Dose::Bolus(bolus)) => {
                    self.bolus(bolus.time() + shift, bolus.amount(), bolus.input())
                }
                LastEntry::Dose(Dose::Infusion(infusion)) => self.infusion(
                    infusion.time() + shift,
                    infusion.amount(),
                    infusion.input(),
                    infusion.duration(),
                ),
                LastEntry::Observation(observation) => self.observation(
                    observation.time() + shift,
                    observation.value(),
                    observation.outeq(),
                ),
            };
        }
        self.last = Some(last);
        self
    }

    pub fn build(self) -> Result<Subject, ConfigurationError> {
        let regimen = DosingRegimen::from_doses(self.doses)?;
        Subject::new(self.id, regimen, self.observations, self.covariates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builder() {
        let subject = Subject::builder("test")
            .observation(3.0, 100.0, 0)
            .repeat(2, 0.5)
            .bolus(1.0, 100.0, 0)
            .infusion(0.0, 100.0, 0, 1.0)
            .repeat(3, 0.3)
            .covariate("wt", 65.0)
            .build()
            .unwrap();
        assert_eq!(subject.id(), "test");
        assert_eq!(subject.observations().len(), 3);
        assert_eq!(subject.regimen().len(), 5);
        assert_eq!(subject.covariate("wt"), Some(65.0));
    }

    #[test]
    fn invalid_dose_fails_build() {
        let result = Subject::builder("bad").bolus(-1.0, 10.0, 0).build();
        assert!(matches!(
            result,
            Err(ConfigurationError::MalformedRegimen(_))
        ));
    }
}
