use crate::data::{ErrorModels, Subject};
use crate::error::{ConfigurationError, PkpdError};
use crate::settings::SolverSettings;
use crate::simulator::MechanisticModel;

/// Log-likelihood of one subject's observations and, optionally, its gradient
///
/// `parameters` holds the model parameters followed by the noise parameters of every output.
/// A failed simulation or a non-finite prediction gives negative infinity with a zero gradient;
/// every other error propagates.
pub(crate) fn subject_log_likelihood(
    model: &MechanisticModel,
    error_models: &ErrorModels,
    subject: &Subject,
    parameters: &[f64],
    settings: &SolverSettings,
    with_gradient: bool,
) -> Result<(f64, Option<Vec<f64>>), PkpdError> {
    let n_model = model.n_parameters();
    let n_total = n_model + error_models.n_parameters();
    if parameters.len() != n_total {
        return Err(ConfigurationError::ParameterCount {
            context: format!("log-likelihood of subject {}", subject.id()),
            expected: n_total,
            found: parameters.len(),
        }
        .into());
    }
    let rejected = || {
        (
            f64::NEG_INFINITY,
            with_gradient.then(|| vec![0.0; n_total]),
        )
    };

    let (theta, noise) = parameters.split_at(n_model);
    let times = subject.observation_times();
    let simulation = if with_gradient {
        model.simulate_with_sensitivities(theta, subject.regimen(), &times, settings)
    } else {
        model.simulate(theta, subject.regimen(), &times, settings)
    };
    let result = match simulation {
        Ok(result) => result,
        Err(PkpdError::Simulation(_)) => return Ok(rejected()),
        Err(err) => return Err(err),
    };

    let mut log_likelihood = 0.0;
    let mut gradient = with_gradient.then(|| vec![0.0; n_total]);
    for observation in subject.observations() {
        let outeq = observation.outeq();
        let error_model = error_models.get(outeq).ok_or_else(|| {
            ConfigurationError::InvalidObservation {
                subject: subject.id().to_string(),
                reason: format!("no error model for output {}", outeq),
            }
        })?;
        let index = result.time_index(observation.time()).ok_or_else(|| {
            PkpdError::NumericalAnomaly(format!(
                "observation time {} missing from the simulation",
                observation.time()
            ))
        })?;
        let predicted = result.outputs()[[index, outeq]];
        if !predicted.is_finite() {
            return Ok(rejected());
        }
        let noise_k = error_models.noise_for(outeq, noise);
        let term = error_model.log_likelihood(observation.value(), predicted, noise_k);
        if term == f64::NEG_INFINITY {
            return Ok(rejected());
        }
        log_likelihood += term;

        if let Some(gradient) = gradient.as_mut() {
            let (d_pred, d_noise) = error_model.gradient(observation.value(), predicted, noise_k);
            if let Some(sensitivities) = result.sensitivities() {
                for (j, g) in gradient.iter_mut().take(n_model).enumerate() {
                    *g += d_pred * sensitivities[[index, outeq, j]];
                }
            }
            let offset = n_model + error_models.offset(outeq);
            for (k, d) in d_noise.iter().enumerate() {
                gradient[offset + k] += d;
            }
        }
    }
    Ok((log_likelihood, gradient))
}

/// The log-likelihood of a single individual's observations
///
/// Parameters are the model parameters followed by the noise parameters of every output, in
/// the order of [IndividualLogLikelihood::parameter_names].
#[derive(Debug, Clone)]
pub struct IndividualLogLikelihood {
    model: MechanisticModel,
    error_models: ErrorModels,
    subject: Subject,
    settings: SolverSettings,
}

impl IndividualLogLikelihood {
    pub fn new(
        model: MechanisticModel,
        error_models: ErrorModels,
        subject: Subject,
        settings: SolverSettings,
    ) -> Result<Self, ConfigurationError> {
        error_models.check_outputs(model.n_outputs())?;
        check_subject(&subject, model.n_outputs())?;
        settings.validate()?;
        Ok(Self {
            model,
            error_models,
            subject,
            settings,
        })
    }

    pub fn n_parameters(&self) -> usize {
        self.model.n_parameters() + self.error_models.n_parameters()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = self.model.parameter_names().to_vec();
        names.extend(self.error_models.parameter_names(self.model.output_names()));
        names
    }

    pub fn model(&self) -> &MechanisticModel {
        &self.model
    }

    pub fn error_models(&self) -> &ErrorModels {
        &self.error_models
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn evaluate(&self, parameters: &[f64]) -> Result<f64, PkpdError> {
        subject_log_likelihood(
            &self.model,
            &self.error_models,
            &self.subject,
            parameters,
            &self.settings,
            false,
        )
        .map(|(value, _)| value)
    }

    pub fn evaluate_with_gradient(&self, parameters: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        let (value, gradient) = subject_log_likelihood(
            &self.model,
            &self.error_models,
            &self.subject,
            parameters,
            &self.settings,
            true,
        )?;
        Ok((value, gradient.unwrap_or_else(|| vec![0.0; self.n_parameters()])))
    }
}

/// Every observation must refer to an existing output
pub(crate) fn check_subject(subject: &Subject, n_outputs: usize) -> Result<(), ConfigurationError> {
    if let Some(outeq) = subject.max_outeq() {
        if outeq >= n_outputs {
            return Err(ConfigurationError::InvalidObservation {
                subject: subject.id().to_string(),
                reason: format!(
                    "observation of output {} but the model has {} outputs",
                    outeq, n_outputs
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ErrorModel, SubjectBuilderExt};
    use approx::assert_relative_eq;

    fn model() -> MechanisticModel {
        MechanisticModel::new(
            |x, p, _t, dx, _rateiv| {
                dx[0] = -p[0] * x[0];
            },
            |_p| lag! {},
            |_p| fa! {},
            |_p, _x| {},
            |x, _p, _t, y| {
                y[0] = x[0];
            },
            (1, 1),
            vec!["k"],
        )
    }

    fn subject() -> Subject {
        Subject::builder("1")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 90.0, 0)
            .observation(4.0, 70.0, 0)
            .build()
            .unwrap()
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let settings = SolverSettings::default().with_tolerances(1e-10, 1e-10);
        let likelihood = IndividualLogLikelihood::new(
            model(),
            ErrorModels::new(vec![ErrorModel::Constant]),
            subject(),
            settings,
        )
        .unwrap();
        let x = [0.1, 2.0];
        let (value, gradient) = likelihood.evaluate_with_gradient(&x).unwrap();
        assert_relative_eq!(value, likelihood.evaluate(&x).unwrap(), max_relative = 1e-8);
        for j in 0..2 {
            let h = 1e-5;
            let mut up = x;
            let mut down = x;
            up[j] += h;
            down[j] -= h;
            let fd = (likelihood.evaluate(&up).unwrap() - likelihood.evaluate(&down).unwrap())
                / (2.0 * h);
            assert_relative_eq!(gradient[j], fd, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn invalid_noise_gives_negative_infinity() {
        let likelihood = IndividualLogLikelihood::new(
            model(),
            ErrorModels::new(vec![ErrorModel::Constant]),
            subject(),
            SolverSettings::default(),
        )
        .unwrap();
        let (value, gradient) = likelihood.evaluate_with_gradient(&[0.1, -1.0]).unwrap();
        assert_eq!(value, f64::NEG_INFINITY);
        assert_eq!(gradient, vec![0.0, 0.0]);
    }

    #[test]
    fn observation_of_unknown_output_is_rejected() {
        let subject = Subject::builder("1").observation(1.0, 1.0, 2).build().unwrap();
        let result = IndividualLogLikelihood::new(
            model(),
            ErrorModels::new(vec![ErrorModel::Constant]),
            subject,
            SolverSettings::default(),
        );
        assert!(result.is_err());
        assert_eq!(
            IndividualLogLikelihood::new(
                model(),
                ErrorModels::new(vec![ErrorModel::Combined]),
                super::tests::subject(),
                SolverSettings::default(),
            )
            .unwrap()
            .parameter_names(),
            vec!["k", "Sigma base", "Sigma rel."]
        );
    }
}
