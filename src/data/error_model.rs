use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Model for the observation noise around the deterministic model output
///
/// An [ErrorModel] maps a predicted value `f` and a vector of noise parameters to the
/// distribution of the observed value `y`. The noise parameters are passed at evaluation time
/// as part of each individual's parameter vector.
///
/// | Variant        | Noise parameters | Distribution of `y`                      |
/// |----------------|------------------|------------------------------------------|
/// | `Constant`     | `σ`              | `N(f, σ)`                                |
/// | `Proportional` | `σ_rel`          | `N(f, σ_rel·|f|)`                        |
/// | `Combined`     | `σ_base, σ_rel`  | `N(f, sqrt(σ_base² + σ_rel²·f²))`        |
/// | `LogNormal`    | `σ_log`          | `ln y ~ N(ln f − σ_log²/2, σ_log)`       |
///
/// Invalid noise parameters (any `σ ≤ 0`) or observations outside the support of the
/// distribution give a log-likelihood of negative infinity rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorModel {
    /// Additive Gaussian error
    Constant,
    /// Multiplicative Gaussian error
    Proportional,
    /// Additive plus multiplicative Gaussian error
    Combined,
    /// Log-normal error, mean-preserving on the natural scale
    LogNormal,
}

impl ErrorModel {
    /// Number of noise parameters of the variant
    pub fn n_parameters(&self) -> usize {
        match self {
            ErrorModel::Combined => 2,
            _ => 1,
        }
    }

    pub fn parameter_names(&self) -> Vec<String> {
        let names: &[&str] = match self {
            ErrorModel::Constant => &["Sigma"],
            ErrorModel::Proportional => &["Sigma rel."],
            ErrorModel::Combined => &["Sigma base", "Sigma rel."],
            ErrorModel::LogNormal => &["Sigma log"],
        };
        names.iter().map(|name| name.to_string()).collect()
    }

    fn noise_is_valid(noise: &[f64]) -> bool {
        noise.iter().all(|sigma| sigma.is_finite() && *sigma > 0.0)
    }

    /// Standard deviation of the Gaussian variants and its derivatives
    ///
    /// Returns `(s, ∂s/∂f, ∂s/∂noise)`.
    fn gaussian_scale(&self, predicted: f64, noise: &[f64]) -> (f64, f64, Vec<f64>) {
        match self {
            ErrorModel::Constant => (noise[0], 0.0, vec![1.0]),
            ErrorModel::Proportional => {
                let sigma = noise[0];
                (
                    sigma * predicted.abs(),
                    sigma * predicted.signum(),
                    vec![predicted.abs()],
                )
            }
            ErrorModel::Combined => {
                let (base, rel) = (noise[0], noise[1]);
                let s = (base.powi(2) + rel.powi(2) * predicted.powi(2)).sqrt();
                (
                    s,
                    rel.powi(2) * predicted / s,
                    vec![base / s, rel * predicted.powi(2) / s],
                )
            }
            ErrorModel::LogNormal => unreachable!("log-normal error has no Gaussian scale"),
        }
    }

    /// Log-likelihood of a single observation
    ///
    /// # Arguments
    ///
    /// * `observed` - The measured value
    /// * `predicted` - The model output at the time of the measurement
    /// * `noise` - The noise parameters, see [ErrorModel::n_parameters]
    pub fn log_likelihood(&self, observed: f64, predicted: f64, noise: &[f64]) -> f64 {
        if noise.len() != self.n_parameters() || !Self::noise_is_valid(noise) {
            return f64::NEG_INFINITY;
        }
        if !predicted.is_finite() {
            return f64::NEG_INFINITY;
        }
        match self {
            ErrorModel::LogNormal => {
                if observed <= 0.0 || predicted <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let sigma = noise[0];
                let ln_y = observed.ln();
                let z = ln_y - predicted.ln() + sigma.powi(2) / 2.0;
                -LN_SQRT_2PI - sigma.ln() - ln_y - z.powi(2) / (2.0 * sigma.powi(2))
            }
            _ => {
                let (s, _, _) = self.gaussian_scale(predicted, noise);
                if !(s > 0.0 && s.is_finite()) {
                    return f64::NEG_INFINITY;
                }
                let r = observed - predicted;
                -LN_SQRT_2PI - s.ln() - r.powi(2) / (2.0 * s.powi(2))
            }
        }
    }

    /// Gradient of [ErrorModel::log_likelihood]
    ///
    /// Returns the partial derivative with respect to the predicted value and the partial
    /// derivatives with respect to each noise parameter. Where the log-likelihood is negative
    /// infinity the gradient is zero.
    pub fn gradient(&self, observed: f64, predicted: f64, noise: &[f64]) -> (f64, Vec<f64>) {
        let zero = (0.0, vec![0.0; self.n_parameters()]);
        if !self.log_likelihood(observed, predicted, noise).is_finite() {
            return zero;
        }
        match self {
            ErrorModel::LogNormal => {
                let sigma = noise[0];
                let z = observed.ln() - predicted.ln() + sigma.powi(2) / 2.0;
                let d_pred = z / (sigma.powi(2) * predicted);
                let d_sigma = -1.0 / sigma + z.powi(2) / sigma.powi(3) - z / sigma;
                (d_pred, vec![d_sigma])
            }
            _ => {
                let (s, ds_dpred, ds_dnoise) = self.gaussian_scale(predicted, noise);
                let r = observed - predicted;
                let dl_ds = r.powi(2) / s.powi(3) - 1.0 / s;
                let d_pred = r / s.powi(2) + dl_ds * ds_dpred;
                let d_noise = ds_dnoise.iter().map(|ds| dl_ds * ds).collect();
                (d_pred, d_noise)
            }
        }
    }

    /// Draw a synthetic observation around `predicted`
    ///
    /// Gives `NaN` when `noise` does not hold [ErrorModel::n_parameters] values.
    pub fn sample<R: Rng + ?Sized>(&self, predicted: f64, noise: &[f64], rng: &mut R) -> f64 {
        if noise.len() != self.n_parameters() {
            return f64::NAN;
        }
        let z: f64 = rng.sample(StandardNormal);
        match self {
            ErrorModel::LogNormal => {
                let sigma = noise[0];
                (predicted.ln() - sigma.powi(2) / 2.0 + sigma * z).exp()
            }
            _ => {
                let (s, _, _) = self.gaussian_scale(predicted, noise);
                predicted + s * z
            }
        }
    }
}

/// One [ErrorModel] per model output
///
/// The noise parameters of all outputs are concatenated in output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorModels {
    models: Vec<ErrorModel>,
}

impl ErrorModels {
    pub fn new(models: Vec<ErrorModel>) -> Self {
        Self { models }
    }

    /// The same error model for each of `n_outputs` outputs
    pub fn uniform(model: ErrorModel, n_outputs: usize) -> Self {
        Self {
            models: vec![model; n_outputs],
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, outeq: usize) -> Option<&ErrorModel> {
        self.models.get(outeq)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ErrorModel> {
        self.models.iter()
    }

    /// Total number of noise parameters
    pub fn n_parameters(&self) -> usize {
        self.models.iter().map(|m| m.n_parameters()).sum()
    }

    /// Noise parameter names, prefixed with the output name when there is more than one output
    pub fn parameter_names(&self, output_names: &[String]) -> Vec<String> {
        let mut names = Vec::with_capacity(self.n_parameters());
        for (outeq, model) in self.models.iter().enumerate() {
            for name in model.parameter_names() {
                if self.models.len() > 1 {
                    let output = output_names
                        .get(outeq)
                        .cloned()
                        .unwrap_or_else(|| format!("Output {}", outeq));
                    names.push(format!("{} {}", output, name));
                } else {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Offset of the noise parameters of `outeq` in the concatenated noise vector
    pub(crate) fn offset(&self, outeq: usize) -> usize {
        self.models[..outeq].iter().map(|m| m.n_parameters()).sum()
    }

    /// Slice of `noise` belonging to output `outeq`
    pub(crate) fn noise_for<'a>(&self, outeq: usize, noise: &'a [f64]) -> &'a [f64] {
        let offset = self.offset(outeq);
        &noise[offset..offset + self.models[outeq].n_parameters()]
    }

    pub(crate) fn check_outputs(&self, n_outputs: usize) -> Result<(), ConfigurationError> {
        if self.models.len() != n_outputs {
            return Err(ConfigurationError::ParameterCount {
                context: "error models".to_string(),
                expected: n_outputs,
                found: self.models.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::f64::consts::PI;

    fn gaussian_log_pdf(x: f64, mean: f64, sd: f64) -> f64 {
        -0.5 * (2.0 * PI).ln() - sd.ln() - (x - mean).powi(2) / (2.0 * sd.powi(2))
    }

    fn fd_gradient(model: ErrorModel, y: f64, f: f64, noise: &[f64]) -> (f64, Vec<f64>) {
        let h = 1e-6;
        let d_pred = (model.log_likelihood(y, f + h, noise)
            - model.log_likelihood(y, f - h, noise))
            / (2.0 * h);
        let d_noise = (0..noise.len())
            .map(|k| {
                let mut up = noise.to_vec();
                let mut down = noise.to_vec();
                up[k] += h;
                down[k] -= h;
                (model.log_likelihood(y, f, &up) - model.log_likelihood(y, f, &down)) / (2.0 * h)
            })
            .collect();
        (d_pred, d_noise)
    }

    #[test]
    fn constant_matches_gaussian_density() {
        let ll = ErrorModel::Constant.log_likelihood(1.3, 1.0, &[0.5]);
        assert_relative_eq!(ll, gaussian_log_pdf(1.3, 1.0, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn invalid_noise_gives_negative_infinity() {
        assert_eq!(
            ErrorModel::Constant.log_likelihood(1.0, 1.0, &[0.0]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            ErrorModel::Combined.log_likelihood(1.0, 1.0, &[0.1, -0.1]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            ErrorModel::LogNormal.log_likelihood(-1.0, 1.0, &[0.1]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            ErrorModel::Proportional.log_likelihood(1.0, 0.0, &[0.1]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn lognormal_includes_jacobian() {
        let (y, f, sigma) = (2.0_f64, 1.5_f64, 0.3_f64);
        let expected = gaussian_log_pdf(y.ln(), f.ln() - sigma.powi(2) / 2.0, sigma) - y.ln();
        assert_relative_eq!(
            ErrorModel::LogNormal.log_likelihood(y, f, &[sigma]),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn gradients_match_finite_differences() {
        let cases = [
            (ErrorModel::Constant, vec![0.4]),
            (ErrorModel::Proportional, vec![0.2]),
            (ErrorModel::Combined, vec![0.3, 0.1]),
            (ErrorModel::LogNormal, vec![0.25]),
        ];
        for (model, noise) in cases {
            let (d_pred, d_noise) = model.gradient(2.2, 2.0, &noise);
            let (fd_pred, fd_noise) = fd_gradient(model, 2.2, 2.0, &noise);
            assert_relative_eq!(d_pred, fd_pred, epsilon = 1e-6, max_relative = 1e-5);
            for (a, b) in d_noise.iter().zip(fd_noise.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-6, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn sampling_with_missing_noise_is_nan() {
        let mut rng = StdRng::seed_from_u64(5);
        for model in [
            ErrorModel::Constant,
            ErrorModel::Proportional,
            ErrorModel::Combined,
            ErrorModel::LogNormal,
        ] {
            assert!(model.sample(3.0, &[], &mut rng).is_nan());
        }
        assert!(ErrorModel::Combined.sample(3.0, &[0.1], &mut rng).is_nan());
        assert!(ErrorModel::Constant.sample(3.0, &[0.1, 0.2], &mut rng).is_nan());
    }

    #[test]
    fn samples_have_expected_mean() {
        let mut rng = StdRng::seed_from_u64(1);
        let n = 20_000;
        let mean: f64 = (0..n)
            .map(|_| ErrorModel::LogNormal.sample(4.0, &[0.2], &mut rng))
            .sum::<f64>()
            / n as f64;
        assert_relative_eq!(mean, 4.0, max_relative = 0.02);
    }

    #[test]
    fn error_models_offsets_and_names() {
        let models = ErrorModels::new(vec![ErrorModel::Combined, ErrorModel::Constant]);
        assert_eq!(models.n_parameters(), 3);
        assert_eq!(models.offset(1), 2);
        assert_eq!(models.noise_for(1, &[1.0, 2.0, 3.0]), &[3.0]);
        let names = models.parameter_names(&["Conc".to_string(), "Effect".to_string()]);
        assert_eq!(
            names,
            vec!["Conc Sigma base", "Conc Sigma rel.", "Effect Sigma"]
        );
        assert!(models.check_outputs(3).is_err());
    }
}
