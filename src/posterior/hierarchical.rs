use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::data::{Data, ErrorModels, Subject};
use crate::error::{ConfigurationError, PkpdError};
use crate::population::PopulationModel;
use crate::posterior::{check_dimension, LogDensity, LogPrior};
use crate::settings::SolverSettings;
use crate::simulator::likelihood::{check_subject, subject_log_likelihood};
use crate::simulator::MechanisticModel;

/// Contribution of a single subject to the hierarchical log-posterior
struct SubjectTerm {
    value: f64,
    /// Gradient with respect to the population parameters
    population: Vec<f64>,
    /// Gradient with respect to this subject's latent draws
    latent: Vec<f64>,
}

/// The log-posterior of a population model with explicit latent draws
///
/// The parameter vector is laid out as
///
/// ```text
/// [population parameters of dimension 0, ..., of dimension D-1,
///  latent draws of subject 0 (dimension order), ..., of subject N-1]
/// ```
///
/// where the dimensions are the model parameters followed by the noise parameters of the
/// error models. Subjects are evaluated in parallel and their contributions summed in
/// dataset order.
#[derive(Debug, Clone)]
pub struct HierarchicalLogPosterior {
    model: MechanisticModel,
    error_models: ErrorModels,
    data: Data,
    population_models: Vec<PopulationModel>,
    priors: Vec<LogPrior>,
    settings: SolverSettings,
    /// Covariate vector of every subject for every dimension
    covariates: Vec<Vec<Vec<f64>>>,
    population_offsets: Vec<usize>,
    latent_offsets: Vec<usize>,
    n_population: usize,
    n_latent: usize,
}

impl HierarchicalLogPosterior {
    /// # Arguments
    ///
    /// * `population_models` - One per individual parameter (model parameters, then noise)
    /// * `priors` - One per population parameter, in layout order
    pub fn new(
        model: MechanisticModel,
        error_models: ErrorModels,
        data: Data,
        population_models: Vec<PopulationModel>,
        priors: Vec<LogPrior>,
        settings: SolverSettings,
    ) -> Result<Self, ConfigurationError> {
        error_models.check_outputs(model.n_outputs())?;
        settings.validate()?;
        let n_individual = model.n_parameters() + error_models.n_parameters();
        check_dimension("population models", n_individual, population_models.len())?;
        if data.is_empty() {
            return Err(ConfigurationError::InvalidPopulationModel(
                "the dataset has no subjects".to_string(),
            ));
        }

        let mut population_offsets = Vec::with_capacity(n_individual);
        let mut latent_offsets = Vec::with_capacity(n_individual);
        let (mut n_population, mut n_latent) = (0, 0);
        for population_model in &population_models {
            population_offsets.push(n_population);
            latent_offsets.push(n_latent);
            n_population += population_model.n_population_parameters();
            n_latent += population_model.n_latent();
        }
        check_dimension("population priors", n_population, priors.len())?;
        for prior in &priors {
            prior.validate()?;
        }

        let mut covariates = Vec::with_capacity(data.len());
        for subject in data.subjects() {
            check_subject(subject, model.n_outputs())?;
            let per_dimension = population_models
                .iter()
                .map(|population_model| subject.covariate_vector(population_model.covariate_names()))
                .collect::<Result<Vec<_>, _>>()?;
            covariates.push(per_dimension);
        }

        Ok(Self {
            model,
            error_models,
            data,
            population_models,
            priors,
            settings,
            covariates,
            population_offsets,
            latent_offsets,
            n_population,
            n_latent,
        })
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn population_models(&self) -> &[PopulationModel] {
        &self.population_models
    }

    /// Number of population parameters at the start of the layout
    pub fn n_population_parameters(&self) -> usize {
        self.n_population
    }

    /// Number of latent draws per subject
    pub fn n_latent_per_subject(&self) -> usize {
        self.n_latent
    }

    /// Names of the individual parameters (model parameters then noise parameters)
    pub fn individual_parameter_names(&self) -> Vec<String> {
        let mut names = self.model.parameter_names().to_vec();
        names.extend(self.error_models.parameter_names(self.model.output_names()));
        names
    }

    fn latent_block<'a>(&self, x: &'a [f64], subject: usize) -> &'a [f64] {
        let start = self.n_population + subject * self.n_latent;
        &x[start..start + self.n_latent]
    }

    fn population_block<'a>(&self, pop: &'a [f64], dimension: usize) -> &'a [f64] {
        let start = self.population_offsets[dimension];
        &pop[start..start + self.population_models[dimension].n_population_parameters()]
    }

    fn subject_parameters(&self, x: &[f64], index: usize) -> Vec<f64> {
        let pop = &x[..self.n_population];
        let latent = self.latent_block(x, index);
        self.population_models
            .iter()
            .enumerate()
            .map(|(d, population_model)| {
                let eta = &latent[self.latent_offsets[d]..self.latent_offsets[d] + population_model.n_latent()];
                population_model
                    .individual_parameter_unchecked(
                        self.population_block(pop, d),
                        eta,
                        &self.covariates[index][d],
                    )
                    .0
            })
            .collect()
    }

    /// The individual parameter vector of every subject, in dataset order
    pub fn individual_parameters(&self, x: &[f64]) -> Result<Vec<Vec<f64>>, PkpdError> {
        check_dimension("hierarchical log-posterior", self.n_parameters(), x.len())?;
        Ok((0..self.data.len())
            .map(|index| self.subject_parameters(x, index))
            .collect())
    }

    fn subject_term(
        &self,
        x: &[f64],
        index: usize,
        subject: &Subject,
        with_gradient: bool,
    ) -> Result<SubjectTerm, PkpdError> {
        let pop = &x[..self.n_population];
        let latent = self.latent_block(x, index);

        let mut theta = Vec::with_capacity(self.population_models.len());
        let mut individual_gradients = Vec::with_capacity(self.population_models.len());
        let mut log_density = 0.0;
        for (d, population_model) in self.population_models.iter().enumerate() {
            let eta = &latent[self.latent_offsets[d]..self.latent_offsets[d] + population_model.n_latent()];
            let pop_d = self.population_block(pop, d);
            let (value, gradient) = population_model.individual_parameter_unchecked(
                pop_d,
                eta,
                &self.covariates[index][d],
            );
            theta.push(value);
            individual_gradients.push(gradient);
            log_density += population_model.log_density_unchecked(pop_d, eta);
        }

        let rejected = SubjectTerm {
            value: f64::NEG_INFINITY,
            population: vec![0.0; self.n_population],
            latent: vec![0.0; self.n_latent],
        };
        if log_density == f64::NEG_INFINITY {
            return Ok(rejected);
        }

        let (log_likelihood, likelihood_gradient) = subject_log_likelihood(
            &self.model,
            &self.error_models,
            subject,
            &theta,
            &self.settings,
            with_gradient,
        )?;
        let value = log_likelihood + log_density;
        if value == f64::NEG_INFINITY {
            return Ok(rejected);
        }

        let mut population = vec![0.0; self.n_population];
        let mut latent_gradient = vec![0.0; self.n_latent];
        if let Some(likelihood_gradient) = likelihood_gradient {
            for (d, population_model) in self.population_models.iter().enumerate() {
                let g = likelihood_gradient[d];
                let pop_offset = self.population_offsets[d];
                let latent_offset = self.latent_offsets[d];
                for (k, dtheta) in individual_gradients[d].population.iter().enumerate() {
                    population[pop_offset + k] += g * dtheta;
                }
                for (k, dtheta) in individual_gradients[d].latent.iter().enumerate() {
                    latent_gradient[latent_offset + k] += g * dtheta;
                }

                let eta = &latent[latent_offset..latent_offset + population_model.n_latent()];
                let density = population_model
                    .log_density_gradient_unchecked(self.population_block(pop, d), eta);
                for (k, dp) in density.population.iter().enumerate() {
                    population[pop_offset + k] += dp;
                }
                for (k, de) in density.latent.iter().enumerate() {
                    latent_gradient[latent_offset + k] += de;
                }
            }
        }

        Ok(SubjectTerm {
            value,
            population,
            latent: latent_gradient,
        })
    }

    fn evaluate_inner(&self, x: &[f64], with_gradient: bool) -> Result<(f64, Vec<f64>), PkpdError> {
        check_dimension("hierarchical log-posterior", self.n_parameters(), x.len())?;
        let n = self.n_parameters();
        let pop = &x[..self.n_population];

        let log_prior: f64 = self
            .priors
            .iter()
            .zip(pop)
            .map(|(prior, value)| prior.log_pdf(*value))
            .sum();
        if log_prior == f64::NEG_INFINITY {
            return Ok((f64::NEG_INFINITY, vec![0.0; n]));
        }

        let terms: Vec<Result<SubjectTerm, PkpdError>> = self
            .data
            .subjects()
            .par_iter()
            .enumerate()
            .map(|(index, subject)| self.subject_term(x, index, subject, with_gradient))
            .collect();

        let mut value = log_prior;
        let mut gradient = vec![0.0; n];
        for (index, term) in terms.into_iter().enumerate() {
            let term = term?;
            if term.value == f64::NEG_INFINITY {
                value = f64::NEG_INFINITY;
                continue;
            }
            value += term.value;
            if with_gradient {
                for (g, dp) in gradient.iter_mut().zip(&term.population) {
                    *g += dp;
                }
                let start = self.n_population + index * self.n_latent;
                for (g, dl) in gradient[start..start + self.n_latent]
                    .iter_mut()
                    .zip(&term.latent)
                {
                    *g += dl;
                }
            }
        }

        if value == f64::NEG_INFINITY {
            return Ok((value, vec![0.0; n]));
        }
        if with_gradient {
            for ((g, prior), p) in gradient.iter_mut().zip(&self.priors).zip(pop) {
                *g += prior.gradient(*p);
            }
        }
        Ok((value, gradient))
    }
}

impl LogDensity for HierarchicalLogPosterior {
    fn n_parameters(&self) -> usize {
        self.n_population + self.data.len() * self.n_latent
    }

    fn parameter_names(&self) -> Vec<String> {
        let individual_names = self.individual_parameter_names();
        let mut names = Vec::with_capacity(self.n_parameters());
        for (population_model, name) in self.population_models.iter().zip(&individual_names) {
            names.extend(population_model.parameter_names(name));
        }
        for subject in self.data.subjects() {
            for (population_model, name) in self.population_models.iter().zip(&individual_names) {
                if population_model.n_latent() > 0 {
                    names.push(format!("ID {}: {}", subject.id(), name));
                }
            }
        }
        names
    }

    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
        self.evaluate_inner(x, false).map(|(value, _)| value)
    }

    fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        self.evaluate_inner(x, true)
    }

    /// Population parameters drawn from the priors, every latent draw at zero
    ///
    /// Not available when a dimension is heterogeneous, since its latent draw is the
    /// parameter itself and has no prior.
    fn sample_initial(&self, rng: &mut StdRng) -> Option<Vec<f64>> {
        if self
            .population_models
            .iter()
            .any(|model| matches!(model, PopulationModel::Heterogeneous))
        {
            return None;
        }
        let mut x: Vec<f64> = self
            .priors
            .iter()
            .map(|prior| prior.sample(rng).ok())
            .collect::<Option<Vec<f64>>>()?;
        x.extend(std::iter::repeat(0.0).take(self.data.len() * self.n_latent));
        Some(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ErrorModel, SubjectBuilderExt};
    use crate::population::{CovariatePopulationModel, LatentShape};
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

    fn data() -> Data {
        let a = Subject::builder("a")
            .bolus(0.0, 10.0, 0)
            .observation(1.0, 9.0, 0)
            .observation(3.0, 7.6, 0)
            .covariate("wt", 1.2)
            .build()
            .unwrap();
        let b = Subject::builder("b")
            .bolus(0.0, 10.0, 0)
            .observation(2.0, 8.0, 0)
            .covariate("wt", 0.8)
            .build()
            .unwrap();
        Data::new(vec![a, b]).unwrap()
    }

    fn posterior() -> HierarchicalLogPosterior {
        HierarchicalLogPosterior::new(
            model(),
            ErrorModels::new(vec![ErrorModel::Constant]),
            data(),
            vec![
                PopulationModel::Covariate(CovariatePopulationModel::new(
                    LatentShape::LogNormal,
                    vec!["wt"],
                )),
                PopulationModel::Pooled,
            ],
            vec![
                LogPrior::Normal { mean: -2.0, sd: 1.0 },
                LogPrior::HalfCauchy { location: 0.0, scale: 1.0 },
                LogPrior::Normal { mean: 0.0, sd: 1.0 },
                LogPrior::HalfCauchy { location: 0.0, scale: 1.0 },
            ],
            SolverSettings::default().with_tolerances(1e-10, 1e-10),
        )
        .unwrap()
    }

    #[test]
    fn layout_and_names() {
        let posterior = posterior();
        assert_eq!(posterior.n_population_parameters(), 4);
        assert_eq!(posterior.n_latent_per_subject(), 1);
        assert_eq!(posterior.n_parameters(), 6);
        assert_eq!(
            posterior.parameter_names(),
            vec![
                "Base mean log k",
                "Std. log k",
                "wt effect on k",
                "Pooled Sigma",
                "ID a: k",
                "ID b: k"
            ]
        );
    }

    #[test]
    fn individual_parameters_follow_covariates() {
        let posterior = posterior();
        let x = [-2.0, 0.1, 0.5, 0.3, 1.0, -1.0];
        let parameters = posterior.individual_parameters(&x).unwrap();
        assert_relative_eq!(parameters[0][0], (-2.0f64 + 0.6 + 0.1).exp(), max_relative = 1e-12);
        assert_relative_eq!(parameters[1][0], (-2.0f64 + 0.4 - 0.1).exp(), max_relative = 1e-12);
        assert_eq!(parameters[1][1], 0.3);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let posterior = posterior();
        let x = vec![-2.0, 0.1, 0.5, 0.3, 1.0, -1.0];
        let (value, gradient) = posterior.evaluate_with_gradient(&x).unwrap();
        assert_relative_eq!(value, posterior.evaluate(&x).unwrap(), max_relative = 1e-8);
        let h = 1e-5;
        for j in 0..x.len() {
            let mut up = x.clone();
            let mut down = x.clone();
            up[j] += h;
            down[j] -= h;
            let fd = (posterior.evaluate(&up).unwrap() - posterior.evaluate(&down).unwrap())
                / (2.0 * h);
            assert_relative_eq!(gradient[j], fd, max_relative = 1e-3, epsilon = 1e-4);
        }
    }

    #[test]
    fn missing_covariate_is_rejected() {
        let subject = Subject::builder("c")
            .bolus(0.0, 10.0, 0)
            .observation(1.0, 9.0, 0)
            .build()
            .unwrap();
        let result = HierarchicalLogPosterior::new(
            model(),
            ErrorModels::new(vec![ErrorModel::Constant]),
            Data::new(vec![subject]).unwrap(),
            vec![
                PopulationModel::Covariate(CovariatePopulationModel::new(
                    LatentShape::Normal,
                    vec!["wt"],
                )),
                PopulationModel::Pooled,
            ],
            vec![LogPrior::Normal { mean: 0.0, sd: 1.0 }; 4],
            SolverSettings::default(),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::MissingCovariate { .. })
        ));
    }

    #[test]
    fn prior_outside_support_short_circuits() {
        let posterior = posterior();
        let x = [-2.0, -0.1, 0.5, 0.3, 1.0, -1.0];
        let (value, gradient) = posterior.evaluate_with_gradient(&x).unwrap();
        assert_eq!(value, f64::NEG_INFINITY);
        assert!(gradient.iter().all(|g| *g == 0.0));
    }
}
