use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::{DosingRegimen, Observation};
use crate::error::ConfigurationError;

/// The main data container for a population analysis
///
/// [Data] is an ordered collection of [Subject]s with unique identifiers. Subjects are always
/// processed in insertion order, which makes every population-level sum reproducible.
///
/// # Examples
///
/// ```
/// use pkpdinfer::*;
///
/// let subject1 = Subject::builder("patient_001")
///     .bolus(0.0, 100.0, 0)
///     .observation(1.0, 5.0, 0)
///     .build()
///     .unwrap();
/// let subject2 = Subject::builder("patient_002")
///     .bolus(0.0, 120.0, 0)
///     .observation(1.0, 6.0, 0)
///     .build()
///     .unwrap();
///
/// let data = Data::new(vec![subject1, subject2]).unwrap();
/// assert_eq!(data.len(), 2);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Data {
    subjects: Vec<Subject>,
}

impl Data {
    /// Constructs a new [Data] object from a vector of [Subject]s
    ///
    /// Fails if two subjects share the same id.
    pub fn new(subjects: Vec<Subject>) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        for subject in &subjects {
            if !seen.insert(subject.id.clone()) {
                return Err(ConfigurationError::DuplicateSubject(subject.id.clone()));
            }
        }
        Ok(Data { subjects })
    }

    pub fn add_subject(&mut self, subject: Subject) -> Result<(), ConfigurationError> {
        if self.get_subject(subject.id()).is_some() {
            return Err(ConfigurationError::DuplicateSubject(subject.id.clone()));
        }
        self.subjects.push(subject);
        Ok(())
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn get_subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id() == id)
    }

    /// Filter the dataset to include only subjects with specific IDs
    pub fn filter_include(&self, include: &[String]) -> Data {
        let subjects = self
            .subjects
            .iter()
            .filter(|subject| include.iter().any(|id| id == subject.id()))
            .cloned()
            .collect();
        Data { subjects }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl<'a> IntoIterator for &'a Data {
    type Item = &'a Subject;
    type IntoIter = std::slice::Iter<'a, Subject>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}

/// A single individual of a dataset
///
/// A [Subject] owns its [DosingRegimen], its observations (sorted by time) and its
/// time-invariant covariates.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Subject {
    pub(crate) id: String,
    pub(crate) regimen: DosingRegimen,
    pub(crate) observations: Vec<Observation>,
    pub(crate) covariates: BTreeMap<String, f64>,
}

impl Subject {
    pub(crate) fn new(
        id: String,
        regimen: DosingRegimen,
        mut observations: Vec<Observation>,
        covariates: BTreeMap<String, f64>,
    ) -> Result<Self, ConfigurationError> {
        for observation in &observations {
            if !observation.time().is_finite() || observation.time() < 0.0 {
                return Err(ConfigurationError::InvalidObservation {
                    subject: id,
                    reason: format!("invalid observation time {}", observation.time()),
                });
            }
            if !observation.value().is_finite() {
                return Err(ConfigurationError::InvalidObservation {
                    subject: id,
                    reason: format!(
                        "non-finite observed value at t = {}",
                        observation.time()
                    ),
                });
            }
        }
        for (name, value) in &covariates {
            if !value.is_finite() {
                return Err(ConfigurationError::InvalidObservation {
                    subject: id,
                    reason: format!("covariate {} is not finite", name),
                });
            }
        }
        observations.sort_by(|a, b| a.time().total_cmp(&b.time()));
        Ok(Subject {
            id,
            regimen,
            observations,
            covariates,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn regimen(&self) -> &DosingRegimen {
        &self.regimen
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn covariates(&self) -> &BTreeMap<String, f64> {
        &self.covariates
    }

    pub fn covariate(&self, name: &str) -> Option<f64> {
        self.covariates.get(name).copied()
    }

    /// Covariate values in the requested order
    pub fn covariate_vector(&self, names: &[String]) -> Result<Vec<f64>, ConfigurationError> {
        names
            .iter()
            .map(|name| {
                self.covariate(name)
                    .ok_or_else(|| ConfigurationError::MissingCovariate {
                        subject: self.id.clone(),
                        name: name.clone(),
                    })
            })
            .collect()
    }

    /// A copy of the subject with a different dosing regimen
    pub fn with_regimen(&self, regimen: DosingRegimen) -> Subject {
        Subject {
            regimen,
            ..self.clone()
        }
    }

    /// Sorted, deduplicated observation times
    pub fn observation_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self.observations.iter().map(|o| o.time()).collect();
        times.dedup();
        times
    }

    /// Largest output index referenced by an observation
    pub(crate) fn max_outeq(&self) -> Option<usize> {
        self.observations.iter().map(|o| o.outeq()).max()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Subject {}", self.id)?;
        write!(f, "{}", self.regimen)?;
        for observation in &self.observations {
            writeln!(f, "  {}", observation)?;
        }
        for (name, value) in &self.covariates {
            writeln!(f, "  Covariate {} = {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SubjectBuilderExt;

    fn subject(id: &str) -> Subject {
        Subject::builder(id)
            .bolus(0.0, 100.0, 0)
            .observation(4.0, 3.0, 0)
            .observation(1.0, 5.0, 0)
            .observation(1.0, 0.5, 1)
            .covariate("wt", 70.0)
            .build()
            .unwrap()
    }

    #[test]
    fn observations_are_sorted() {
        let subject = subject("a");
        let times: Vec<f64> = subject.observations().iter().map(|o| o.time()).collect();
        assert_eq!(times, vec![1.0, 1.0, 4.0]);
        assert_eq!(subject.observation_times(), vec![1.0, 4.0]);
        assert_eq!(subject.max_outeq(), Some(1));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(Data::new(vec![subject("a"), subject("a")]).is_err());
        let mut data = Data::new(vec![subject("a")]).unwrap();
        assert!(data.add_subject(subject("b")).is_ok());
        assert!(data.add_subject(subject("b")).is_err());
        assert_eq!(data.filter_include(&["b".to_string()]).len(), 1);
    }

    #[test]
    fn covariate_vector_requires_every_name() {
        let subject = subject("a");
        assert_eq!(
            subject.covariate_vector(&["wt".to_string()]).unwrap(),
            vec![70.0]
        );
        let err = subject
            .covariate_vector(&["wt".to_string(), "age".to_string()])
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::MissingCovariate {
                subject: "a".to_string(),
                name: "age".to_string()
            }
        );
    }

    #[test]
    fn non_finite_observation_is_rejected() {
        let result = Subject::builder("x").observation(1.0, f64::NAN, 0).build();
        assert!(result.is_err());
    }
}
