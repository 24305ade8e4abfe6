use std::collections::BTreeMap;
use std::path::Path;

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::data::{DosingRegimen, ErrorModels};
use crate::error::{ConfigurationError, PkpdError};
use crate::population::PopulationModel;
use crate::posterior::{check_dimension, LogPrior};
use crate::settings::SolverSettings;
use crate::simulator::MechanisticModel;

/// One synthetic measurement in long format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictiveRecord {
    #[serde(rename = "Sample ID")]
    pub sample_id: usize,
    #[serde(rename = "Biomarker")]
    pub output: String,
    #[serde(rename = "Time")]
    pub time: f64,
    #[serde(rename = "Sample")]
    pub value: f64,
}

/// Synthetic measurements of shape `n_outputs × n_times × n_samples`
#[derive(Debug, Clone)]
pub struct PredictiveSamples {
    output_names: Vec<String>,
    times: Vec<f64>,
    values: Array3<f64>,
}

impl PredictiveSamples {
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Ascending measurement times
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    pub fn n_samples(&self) -> usize {
        self.values.shape()[2]
    }

    /// Flatten into records ordered by output, then time, then sample
    pub fn to_records(&self) -> Vec<PredictiveRecord> {
        let mut records = Vec::with_capacity(self.values.len());
        for (o, name) in self.output_names.iter().enumerate() {
            for (t, time) in self.times.iter().enumerate() {
                for s in 0..self.n_samples() {
                    records.push(PredictiveRecord {
                        sample_id: s + 1,
                        output: name.clone(),
                        time: *time,
                        value: self.values[[o, t, s]],
                    });
                }
            }
        }
        records
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PkpdError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in self.to_records() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// A mechanistic model with an error model on each output
///
/// Its parameters are the model parameters followed by the noise parameters. Sampling solves
/// the model once and draws measurements around the solution.
#[derive(Debug, Clone)]
pub struct PredictiveModel {
    model: MechanisticModel,
    error_models: ErrorModels,
}

impl PredictiveModel {
    pub fn new(model: MechanisticModel, error_models: ErrorModels) -> Result<Self, ConfigurationError> {
        error_models.check_outputs(model.n_outputs())?;
        Ok(Self {
            model,
            error_models,
        })
    }

    pub fn model(&self) -> &MechanisticModel {
        &self.model
    }

    pub fn error_models(&self) -> &ErrorModels {
        &self.error_models
    }

    pub fn n_parameters(&self) -> usize {
        self.model.n_parameters() + self.error_models.n_parameters()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = self.model.parameter_names().to_vec();
        names.extend(self.error_models.parameter_names(self.model.output_names()));
        names
    }

    /// Draw `n_samples` measurements per output and time
    pub fn sample(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        times: &[f64],
        n_samples: usize,
        seed: u64,
        settings: &SolverSettings,
    ) -> Result<PredictiveSamples, PkpdError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = self.empty(times, n_samples);
        self.fill(parameters, regimen, &mut samples, 0..n_samples, settings, &mut rng)?;
        Ok(samples)
    }

    fn empty(&self, times: &[f64], n_samples: usize) -> PredictiveSamples {
        let mut times = times.to_vec();
        times.sort_by(|a, b| a.total_cmp(b));
        times.dedup();
        PredictiveSamples {
            output_names: self.model.output_names().to_vec(),
            values: Array3::zeros((self.model.n_outputs(), times.len(), n_samples)),
            times,
        }
    }

    /// Simulate once and draw the sample columns in `columns`
    fn fill(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        samples: &mut PredictiveSamples,
        columns: std::ops::Range<usize>,
        settings: &SolverSettings,
        rng: &mut StdRng,
    ) -> Result<(), PkpdError> {
        check_dimension("predictive model", self.n_parameters(), parameters.len())?;
        let (theta, noise) = parameters.split_at(self.model.n_parameters());
        let result = self.model.simulate(theta, regimen, &samples.times, settings)?;
        let outputs = result.outputs();
        for (outeq, error_model) in self.error_models.iter().enumerate() {
            let noise_k = self.error_models.noise_for(outeq, noise);
            for t in 0..samples.times.len() {
                let predicted = outputs[[t, outeq]];
                for s in columns.clone() {
                    samples.values[[outeq, t, s]] = error_model.sample(predicted, noise_k, rng);
                }
            }
        }
        Ok(())
    }
}

/// Predictions with parameters drawn from a prior
///
/// Every sample uses a fresh parameter draw.
#[derive(Debug, Clone)]
pub struct PriorPredictiveModel {
    predictive: PredictiveModel,
    priors: Vec<LogPrior>,
}

impl PriorPredictiveModel {
    pub fn new(predictive: PredictiveModel, priors: Vec<LogPrior>) -> Result<Self, ConfigurationError> {
        check_dimension("priors", predictive.n_parameters(), priors.len())?;
        for prior in &priors {
            prior.validate()?;
        }
        Ok(Self { predictive, priors })
    }

    pub fn sample(
        &self,
        regimen: &DosingRegimen,
        times: &[f64],
        n_samples: usize,
        seed: u64,
        settings: &SolverSettings,
    ) -> Result<PredictiveSamples, PkpdError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = self.predictive.empty(times, n_samples);
        for s in 0..n_samples {
            let parameters = self
                .priors
                .iter()
                .map(|prior| prior.sample(&mut rng))
                .collect::<Result<Vec<f64>, _>>()?;
            self.predictive
                .fill(&parameters, regimen, &mut samples, s..s + 1, settings, &mut rng)?;
        }
        Ok(samples)
    }
}

/// Predictions for new individuals of a population
///
/// Each sample draws latent values from the population models, maps them to individual
/// parameters and draws one measurement per output and time.
#[derive(Debug, Clone)]
pub struct PopulationPredictiveModel {
    predictive: PredictiveModel,
    population_models: Vec<PopulationModel>,
}

impl PopulationPredictiveModel {
    pub fn new(
        predictive: PredictiveModel,
        population_models: Vec<PopulationModel>,
    ) -> Result<Self, ConfigurationError> {
        check_dimension(
            "population models",
            predictive.n_parameters(),
            population_models.len(),
        )?;
        if population_models
            .iter()
            .any(|model| matches!(model, PopulationModel::Heterogeneous))
        {
            return Err(ConfigurationError::InvalidPopulationModel(
                "heterogeneous population models cannot predict new individuals".to_string(),
            ));
        }
        Ok(Self {
            predictive,
            population_models,
        })
    }

    pub fn n_parameters(&self) -> usize {
        self.population_models
            .iter()
            .map(|model| model.n_population_parameters())
            .sum()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.population_models
            .iter()
            .zip(self.predictive.parameter_names())
            .flat_map(|(model, name)| model.parameter_names(&name))
            .collect()
    }

    /// # Arguments
    ///
    /// * `parameters` - Population parameters in the order of [Self::parameter_names]
    /// * `covariates` - Covariates of the predicted individuals
    pub fn sample(
        &self,
        parameters: &[f64],
        covariates: &BTreeMap<String, f64>,
        regimen: &DosingRegimen,
        times: &[f64],
        n_samples: usize,
        seed: u64,
        settings: &SolverSettings,
    ) -> Result<PredictiveSamples, PkpdError> {
        check_dimension("population parameters", self.n_parameters(), parameters.len())?;
        let covariate_vectors = self
            .population_models
            .iter()
            .map(|model| {
                model
                    .covariate_names()
                    .iter()
                    .map(|name| {
                        covariates.get(name).copied().ok_or_else(|| {
                            ConfigurationError::MissingCovariate {
                                subject: "predicted individual".to_string(),
                                name: name.clone(),
                            }
                        })
                    })
                    .collect::<Result<Vec<f64>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = self.predictive.empty(times, n_samples);
        for s in 0..n_samples {
            let mut offset = 0;
            let mut individual = Vec::with_capacity(self.population_models.len());
            for (model, covariates) in self.population_models.iter().zip(&covariate_vectors) {
                let pop = &parameters[offset..offset + model.n_population_parameters()];
                offset += model.n_population_parameters();
                let eta = model.sample_latent(pop, covariates, &mut rng)?;
                individual.push(model.individual_parameter(pop, &eta, covariates)?);
            }
            self.predictive
                .fill(&individual, regimen, &mut samples, s..s + 1, settings, &mut rng)?;
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dose, ErrorModel};
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

    fn regimen() -> DosingRegimen {
        DosingRegimen::from_doses(vec![Dose::bolus(0.0, 100.0, 0)]).unwrap()
    }

    #[test]
    fn samples_scatter_around_the_solution() {
        let predictive =
            PredictiveModel::new(model(), ErrorModels::new(vec![ErrorModel::Constant])).unwrap();
        assert_eq!(predictive.parameter_names(), vec!["k", "Sigma"]);
        let samples = predictive
            .sample(
                &[0.1, 0.5],
                &regimen(),
                &[5.0, 1.0],
                2000,
                7,
                &SolverSettings::default(),
            )
            .unwrap();
        assert_eq!(samples.times(), &[1.0, 5.0]);
        assert_eq!(samples.values().shape(), &[1, 2, 2000]);
        let mean = samples.values().slice(ndarray::s![0, 0, ..]).mean().unwrap();
        assert_relative_eq!(mean, 100.0 * (-0.1f64).exp(), epsilon = 0.1);
        assert_eq!(samples.to_records().len(), 4000);
    }

    #[test]
    fn same_seed_same_samples() {
        let predictive =
            PredictiveModel::new(model(), ErrorModels::new(vec![ErrorModel::Constant])).unwrap();
        let priors = vec![
            LogPrior::Uniform { lower: 0.05, upper: 0.2 },
            LogPrior::Uniform { lower: 0.1, upper: 1.0 },
        ];
        let prior_predictive = PriorPredictiveModel::new(predictive, priors).unwrap();
        let settings = SolverSettings::default();
        let a = prior_predictive.sample(&regimen(), &[1.0, 2.0], 5, 11, &settings).unwrap();
        let b = prior_predictive.sample(&regimen(), &[1.0, 2.0], 5, 11, &settings).unwrap();
        assert_eq!(a.values(), b.values());
    }

    #[test]
    fn population_prediction_requires_covariates() {
        use crate::population::{CovariatePopulationModel, LatentShape};
        let predictive =
            PredictiveModel::new(model(), ErrorModels::new(vec![ErrorModel::Constant])).unwrap();
        let population = PopulationPredictiveModel::new(
            predictive,
            vec![
                PopulationModel::Covariate(CovariatePopulationModel::new(
                    LatentShape::LogNormal,
                    vec!["wt"],
                )),
                PopulationModel::Pooled,
            ],
        )
        .unwrap();
        assert_eq!(
            population.parameter_names(),
            vec!["Base mean log k", "Std. log k", "wt effect on k", "Pooled Sigma"]
        );
        let parameters = [0.1f64.ln(), 0.2, 0.0, 0.5];
        let settings = SolverSettings::default();
        let missing = population.sample(
            &parameters,
            &BTreeMap::new(),
            &regimen(),
            &[1.0],
            3,
            0,
            &settings,
        );
        assert!(matches!(
            missing,
            Err(PkpdError::Configuration(ConfigurationError::MissingCovariate { .. }))
        ));
        let covariates = BTreeMap::from([("wt".to_string(), 70.0)]);
        let samples = population
            .sample(&parameters, &covariates, &regimen(), &[1.0], 3, 0, &settings)
            .unwrap();
        assert!(samples.values().iter().all(|v| v.is_finite()));
    }
}
