use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergenceWarning, PkpdError};

/// One optimiser run mapped back to the full model parametrisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisationRun {
    pub initial: Vec<f64>,
    pub parameters: Vec<f64>,
    pub log_density: f64,
    pub iterations: u64,
    pub converged: bool,
    pub termination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisationResult {
    pub(crate) parameter_names: Vec<String>,
    pub(crate) runs: Vec<OptimisationRun>,
    pub(crate) best: usize,
    /// Laplace standard errors at the best estimate; zero for fixed parameters
    pub(crate) standard_errors: Option<Vec<f64>>,
    pub(crate) warnings: Vec<ConvergenceWarning>,
}

impl OptimisationResult {
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn runs(&self) -> &[OptimisationRun] {
        &self.runs
    }

    /// The run with the largest log-density
    pub fn best(&self) -> &OptimisationRun {
        &self.runs[self.best]
    }

    pub fn best_parameters(&self) -> &[f64] {
        &self.runs[self.best].parameters
    }

    pub fn log_density(&self) -> f64 {
        self.runs[self.best].log_density
    }

    pub fn standard_errors(&self) -> Option<&[f64]> {
        self.standard_errors.as_deref()
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    /// Best estimate by parameter name
    pub fn to_named(&self) -> BTreeMap<String, f64> {
        self.parameter_names
            .iter()
            .cloned()
            .zip(self.best_parameters().iter().copied())
            .collect()
    }

    pub fn standard_errors_named(&self) -> Option<BTreeMap<String, f64>> {
        self.standard_errors.as_ref().map(|errors| {
            self.parameter_names
                .iter()
                .cloned()
                .zip(errors.iter().copied())
                .collect()
        })
    }

    pub fn to_json(&self) -> Result<String, PkpdError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for OptimisationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Best of {} run(s): log-density {:.6}",
            self.runs.len(),
            self.log_density()
        )?;
        for (i, (name, value)) in self
            .parameter_names
            .iter()
            .zip(self.best_parameters())
            .enumerate()
        {
            match &self.standard_errors {
                Some(errors) => writeln!(f, "  {:<24} {:>14.6} ± {:.6}", name, value, errors[i])?,
                None => writeln!(f, "  {:<24} {:>14.6}", name, value)?,
            }
        }
        Ok(())
    }
}

/// Posterior draws after warm-up, in the full model parametrisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingResult {
    pub(crate) parameter_names: Vec<String>,
    /// `chains[c][i]` is the full parameter vector of iteration `i` of chain `c`
    pub(crate) chains: Vec<Vec<Vec<f64>>>,
    pub(crate) log_densities: Vec<Vec<f64>>,
    pub(crate) acceptance_rates: Vec<f64>,
    pub(crate) warmup: usize,
    pub(crate) rhat: Vec<f64>,
    pub(crate) warnings: Vec<ConvergenceWarning>,
}

impl SamplingResult {
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn chains(&self) -> &[Vec<Vec<f64>>] {
        &self.chains
    }

    pub fn log_densities(&self) -> &[Vec<f64>] {
        &self.log_densities
    }

    pub fn acceptance_rates(&self) -> &[f64] {
        &self.acceptance_rates
    }

    /// Number of discarded iterations at the start of every chain
    pub fn warmup(&self) -> usize {
        self.warmup
    }

    /// Split-R̂ per parameter; NaN for fixed parameters
    pub fn rhat(&self) -> &[f64] {
        &self.rhat
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    /// Draws of parameter `index`, all chains concatenated
    pub fn draws(&self, index: usize) -> Vec<f64> {
        self.chains
            .iter()
            .flat_map(|chain| chain.iter().map(move |x| x[index]))
            .collect()
    }

    /// Pooled draws by parameter name
    pub fn to_named(&self) -> BTreeMap<String, Vec<f64>> {
        self.parameter_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.draws(i)))
            .collect()
    }

    /// Posterior mean of every parameter
    pub fn mean(&self) -> Vec<f64> {
        (0..self.parameter_names.len())
            .map(|i| {
                let draws = self.draws(i);
                draws.iter().sum::<f64>() / draws.len().max(1) as f64
            })
            .collect()
    }

    /// Write one row per draw: chain, iteration, log-density and one column per parameter
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PkpdError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        let mut header = vec![
            "chain".to_string(),
            "iteration".to_string(),
            "log_density".to_string(),
        ];
        header.extend(self.parameter_names.iter().cloned());
        writer.write_record(&header)?;
        for (c, (chain, log_densities)) in self.chains.iter().zip(&self.log_densities).enumerate() {
            for (i, (x, log_density)) in chain.iter().zip(log_densities).enumerate() {
                let mut record = vec![
                    c.to_string(),
                    (self.warmup + i).to_string(),
                    log_density.to_string(),
                ];
                record.extend(x.iter().map(|v| v.to_string()));
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PkpdError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Potential scale reduction of split chains
///
/// Every chain is cut in half and the halves are treated as separate chains. Returns NaN
/// with fewer than four draws per chain.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0) / 2;
    if n < 2 || chains.is_empty() {
        return f64::NAN;
    }
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| {
            let start = chain.len() - 2 * n;
            [&chain[start..start + n], &chain[start + n..]]
        })
        .collect();
    let m = halves.len() as f64;
    let nf = n as f64;
    let means: Vec<f64> = halves.iter().map(|h| h.iter().sum::<f64>() / nf).collect();
    let grand = means.iter().sum::<f64>() / m;
    let between = nf / (m - 1.0) * means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>();
    let within = halves
        .iter()
        .zip(&means)
        .map(|(h, mu)| h.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (nf - 1.0))
        .sum::<f64>()
        / m;
    if within == 0.0 {
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let pooled = (nf - 1.0) / nf * within + between / nf;
    (pooled / within).sqrt()
}
