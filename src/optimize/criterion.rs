use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::simulator::SimulationResult;

/// What a dosing regimen should achieve, expressed as a cost to minimise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetCriterion {
    /// Hit `target` at each of `times`; cost is the sum of squared relative deviations
    Level {
        output: usize,
        target: f64,
        times: Vec<f64>,
    },
    /// Stay within `[low, high]` on an even grid over `[start, end]`
    ///
    /// Cost is the mean squared distance to the window relative to its width; zero inside.
    Window {
        output: usize,
        low: f64,
        high: f64,
        start: f64,
        end: f64,
        n_points: usize,
    },
    /// Reach an area under the curve of `target` over `[start, end]` (trapezoidal rule)
    Exposure {
        output: usize,
        target: f64,
        start: f64,
        end: f64,
        n_points: usize,
    },
}

fn grid(start: f64, end: f64, n_points: usize) -> Vec<f64> {
    if n_points == 1 {
        return vec![start];
    }
    let step = (end - start) / (n_points - 1) as f64;
    (0..n_points).map(|i| start + i as f64 * step).collect()
}

impl TargetCriterion {
    pub fn output(&self) -> usize {
        match self {
            TargetCriterion::Level { output, .. }
            | TargetCriterion::Window { output, .. }
            | TargetCriterion::Exposure { output, .. } => *output,
        }
    }

    pub fn validate(&self, n_outputs: usize) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| Err(ConfigurationError::InvalidSetting(reason));
        if self.output() >= n_outputs {
            return invalid(format!(
                "target output {} but the model has {} outputs",
                self.output(),
                n_outputs
            ));
        }
        match self {
            TargetCriterion::Level { target, times, .. } => {
                if !target.is_finite() || *target == 0.0 {
                    return invalid(format!("level target must be finite and non-zero, got {}", target));
                }
                if times.is_empty() || times.iter().any(|t| !t.is_finite() || *t < 0.0) {
                    return invalid("level target needs finite, non-negative times".to_string());
                }
            }
            TargetCriterion::Window {
                low,
                high,
                start,
                end,
                n_points,
                ..
            } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return invalid(format!("invalid window [{}, {}]", low, high));
                }
                check_interval(*start, *end, *n_points)?;
            }
            TargetCriterion::Exposure {
                target,
                start,
                end,
                n_points,
                ..
            } => {
                if !target.is_finite() || *target <= 0.0 {
                    return invalid(format!("exposure target must be positive, got {}", target));
                }
                check_interval(*start, *end, *n_points)?;
                if *n_points < 2 {
                    return invalid("exposure needs at least two grid points".to_string());
                }
            }
        }
        Ok(())
    }

    /// Time points the model must be simulated at
    pub fn times(&self) -> Vec<f64> {
        match self {
            TargetCriterion::Level { times, .. } => times.clone(),
            TargetCriterion::Window {
                start,
                end,
                n_points,
                ..
            }
            | TargetCriterion::Exposure {
                start,
                end,
                n_points,
                ..
            } => grid(*start, *end, *n_points),
        }
    }

    /// Cost of a simulation that contains every time of [TargetCriterion::times]
    pub fn cost(&self, result: &SimulationResult) -> f64 {
        let output = result.output(self.output());
        let values: Vec<f64> = self
            .times()
            .iter()
            .map(|t| {
                result
                    .time_index(*t)
                    .map_or(f64::NAN, |index| output[index])
            })
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return f64::INFINITY;
        }
        match self {
            TargetCriterion::Level { target, .. } => values
                .iter()
                .map(|v| ((v - target) / target).powi(2))
                .sum(),
            TargetCriterion::Window { low, high, .. } => {
                let width = high - low;
                values
                    .iter()
                    .map(|v| {
                        let distance = if v < low {
                            low - v
                        } else if v > high {
                            v - high
                        } else {
                            0.0
                        };
                        (distance / width).powi(2)
                    })
                    .sum::<f64>()
                    / values.len() as f64
            }
            TargetCriterion::Exposure { target, .. } => {
                let times = self.times();
                let auc: f64 = times
                    .windows(2)
                    .zip(values.windows(2))
                    .map(|(t, v)| 0.5 * (t[1] - t[0]) * (v[0] + v[1]))
                    .sum();
                ((auc - target) / target).powi(2)
            }
        }
    }
}

fn check_interval(start: f64, end: f64, n_points: usize) -> Result<(), ConfigurationError> {
    if !(start.is_finite() && end.is_finite() && start >= 0.0 && start <= end) || n_points == 0 {
        return Err(ConfigurationError::InvalidSetting(format!(
            "invalid evaluation grid [{}, {}] with {} points",
            start, end, n_points
        )));
    }
    Ok(())
}
