use serde::{Deserialize, Serialize};

/// Distribution of an individual parameter on its natural scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatentShape {
    /// `θ = location + σ η`
    Normal,
    /// `θ = exp(location + σ η)`
    LogNormal,
}

impl LatentShape {
    /// Map the latent value `z` to the parameter and return `(θ, dθ/dz)`
    pub(crate) fn apply(&self, z: f64) -> (f64, f64) {
        match self {
            LatentShape::Normal => (z, 1.0),
            LatentShape::LogNormal => {
                let theta = z.exp();
                (theta, theta)
            }
        }
    }

    pub(crate) fn scale_prefix(&self) -> &'static str {
        match self {
            LatentShape::Normal => "",
            LatentShape::LogNormal => "log ",
        }
    }
}

/// Random effects whose location is an affine function of covariates
///
/// The population parameters are `[base location, σ, β_1, ..., β_k]` and an individual with
/// covariates `c` has
///
/// ```text
/// z = base + Σ β_i c_i + σ η,    θ = shape(z)
/// ```
///
/// The covariate names are fixed per instance. Every individual must carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariatePopulationModel {
    shape: LatentShape,
    covariate_names: Vec<String>,
}

impl CovariatePopulationModel {
    pub fn new(shape: LatentShape, covariate_names: Vec<&str>) -> Self {
        Self {
            shape,
            covariate_names: covariate_names.into_iter().map(String::from).collect(),
        }
    }

    pub fn shape(&self) -> LatentShape {
        self.shape
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn n_covariates(&self) -> usize {
        self.covariate_names.len()
    }

    pub(crate) fn n_parameters(&self) -> usize {
        2 + self.covariate_names.len()
    }

    pub(crate) fn parameter_names(&self, name: &str) -> Vec<String> {
        let prefix = self.shape.scale_prefix();
        let mut names = vec![
            format!("Base mean {}{}", prefix, name),
            format!("Std. {}{}", prefix, name),
        ];
        names.extend(
            self.covariate_names
                .iter()
                .map(|covariate| format!("{} effect on {}", covariate, name)),
        );
        names
    }

    pub(crate) fn location(&self, pop: &[f64], covariates: &[f64]) -> f64 {
        pop[0]
            + pop[2..]
                .iter()
                .zip(covariates.iter())
                .map(|(beta, c)| beta * c)
                .sum::<f64>()
    }

    /// `(θ, ∂θ/∂pop, ∂θ/∂η)`
    pub(crate) fn individual_parameter(
        &self,
        pop: &[f64],
        eta: f64,
        covariates: &[f64],
    ) -> (f64, Vec<f64>, f64) {
        let sigma = pop[1];
        let z = self.location(pop, covariates) + sigma * eta;
        let (theta, dtheta_dz) = self.shape.apply(z);
        let mut d_pop = Vec::with_capacity(self.n_parameters());
        d_pop.push(dtheta_dz);
        d_pop.push(dtheta_dz * eta);
        d_pop.extend(covariates.iter().map(|c| dtheta_dz * c));
        (theta, d_pop, dtheta_dz * sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn names_follow_the_shape() {
        let model = CovariatePopulationModel::new(LatentShape::LogNormal, vec!["wt", "age"]);
        assert_eq!(
            model.parameter_names("ke"),
            vec![
                "Base mean log ke",
                "Std. log ke",
                "wt effect on ke",
                "age effect on ke"
            ]
        );
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = CovariatePopulationModel::new(LatentShape::LogNormal, vec!["wt"]);
        let pop = [0.5, 0.2, 0.01];
        let cov = [70.0];
        let eta = 0.3;
        let (theta, d_pop, d_eta) = model.individual_parameter(&pop, eta, &cov);
        assert_relative_eq!(theta, (0.5f64 + 0.7 + 0.06).exp(), max_relative = 1e-12);
        let h = 1e-7;
        for j in 0..3 {
            let mut up = pop;
            let mut down = pop;
            up[j] += h;
            down[j] -= h;
            let fd = (model.individual_parameter(&up, eta, &cov).0
                - model.individual_parameter(&down, eta, &cov).0)
                / (2.0 * h);
            assert_relative_eq!(d_pop[j], fd, max_relative = 1e-5);
        }
        let fd_eta = (model.individual_parameter(&pop, eta + h, &cov).0
            - model.individual_parameter(&pop, eta - h, &cov).0)
            / (2.0 * h);
        assert_relative_eq!(d_eta, fd_eta, max_relative = 1e-5);
    }
}
