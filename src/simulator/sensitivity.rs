//! Finite-difference Jacobians for forward sensitivity propagation.
//!
//! The augmented state is `z = [x; vec(S)]` where `S = ∂x/∂θ` is stored column-major
//! (`n_states × n_params`). Between breakpoints it obeys `dS/dt = J_x S + J_θ`.

use std::collections::HashMap;

use crate::simulator::{DiffEq, Fa, Init, Lag, Out, M, T, V};

/// Central difference step for a value
pub(crate) fn step(value: f64, relative: f64) -> f64 {
    relative * value.abs().max(1.0)
}

/// Parameter vectors shifted up and down along each axis
#[derive(Debug, Clone)]
pub(crate) struct ParameterPerturbation {
    pub(crate) plus: Vec<V>,
    pub(crate) minus: Vec<V>,
    pub(crate) steps: Vec<f64>,
}

impl ParameterPerturbation {
    pub(crate) fn new(theta: &V, relative: f64) -> Self {
        let mut plus = Vec::with_capacity(theta.len());
        let mut minus = Vec::with_capacity(theta.len());
        let mut steps = Vec::with_capacity(theta.len());
        for j in 0..theta.len() {
            let h = step(theta[j], relative);
            let mut up = theta.clone();
            let mut down = theta.clone();
            up[j] += h;
            down[j] -= h;
            plus.push(up);
            minus.push(down);
            steps.push(h);
        }
        Self { plus, minus, steps }
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Jacobian of `f` with respect to its vector argument
///
/// `f` maps an `n`-vector to an `m`-vector.
pub(crate) fn jacobian(f: &dyn Fn(&V, &mut V), x: &V, m: usize, relative: f64) -> M {
    let n = x.len();
    let mut jac = M::zeros(m, n);
    let mut f_plus = V::zeros(m);
    let mut f_minus = V::zeros(m);
    for i in 0..n {
        let h = step(x[i], relative);
        let mut up = x.clone();
        let mut down = x.clone();
        up[i] += h;
        down[i] -= h;
        f_plus.fill(0.0);
        f_minus.fill(0.0);
        f(&up, &mut f_plus);
        f(&down, &mut f_minus);
        jac.set_column(i, &((&f_plus - &f_minus) / (2.0 * h)));
    }
    jac
}

/// Right-hand side of the augmented system
///
/// `rates` holds the infusion rate at the unperturbed parameters, `rates_perturbed` the rates
/// at each entry of `perturbation` (bioavailability may depend on the parameters).
#[allow(clippy::too_many_arguments)]
pub(crate) fn augmented_rhs(
    diffeq: DiffEq,
    t: T,
    z: &V,
    theta: &V,
    rates: &V,
    rates_perturbed: &[(V, V)],
    perturbation: &ParameterPerturbation,
    n_states: usize,
    relative: f64,
    dz: &mut V,
) {
    let n_params = perturbation.len();
    let x = z.rows(0, n_states).into_owned();
    let sens = M::from_column_slice(n_states, n_params, &z.as_slice()[n_states..]);

    let mut dx = V::zeros(n_states);
    diffeq(&x, theta, t, &mut dx, rates);

    let state_rhs = |xs: &V, out: &mut V| diffeq(xs, theta, t, out, rates);
    let jx = jacobian(&state_rhs, &x, n_states, relative);
    let mut ds = &jx * &sens;

    let mut f_plus = V::zeros(n_states);
    let mut f_minus = V::zeros(n_states);
    for j in 0..n_params {
        f_plus.fill(0.0);
        f_minus.fill(0.0);
        let (rate_plus, rate_minus) = &rates_perturbed[j];
        diffeq(&x, &perturbation.plus[j], t, &mut f_plus, rate_plus);
        diffeq(&x, &perturbation.minus[j], t, &mut f_minus, rate_minus);
        let column = (&f_plus - &f_minus) / (2.0 * perturbation.steps[j]);
        let mut target = ds.column_mut(j);
        target += column;
    }

    dz.rows_mut(0, n_states).copy_from(&dx);
    dz.as_mut_slice()[n_states..].copy_from_slice(ds.as_slice());
}

/// `∂x0/∂θ` for the initial condition
pub(crate) fn initial_sensitivity(
    init: Init,
    perturbation: &ParameterPerturbation,
    n_states: usize,
) -> M {
    let mut sens = M::zeros(n_states, perturbation.len());
    for j in 0..perturbation.len() {
        let mut x_plus = V::zeros(n_states);
        let mut x_minus = V::zeros(n_states);
        init(&perturbation.plus[j], &mut x_plus);
        init(&perturbation.minus[j], &mut x_minus);
        sens.set_column(j, &((x_plus - x_minus) / (2.0 * perturbation.steps[j])));
    }
    sens
}

/// Output sensitivities `(∂out/∂x) S + ∂out/∂θ` at a single time point
#[allow(clippy::too_many_arguments)]
pub(crate) fn output_sensitivity(
    out: Out,
    x: &V,
    theta: &V,
    t: T,
    sens: &M,
    perturbation: &ParameterPerturbation,
    n_outputs: usize,
    relative: f64,
) -> M {
    let output = |xs: &V, y: &mut V| out(xs, theta, t, y);
    let jx = jacobian(&output, x, n_outputs, relative);
    let mut result = &jx * sens;
    for j in 0..perturbation.len() {
        let mut y_plus = V::zeros(n_outputs);
        let mut y_minus = V::zeros(n_outputs);
        out(x, &perturbation.plus[j], t, &mut y_plus);
        out(x, &perturbation.minus[j], t, &mut y_minus);
        let column = (y_plus - y_minus) / (2.0 * perturbation.steps[j]);
        let mut target = result.column_mut(j);
        target += column;
    }
    result
}

/// Per-compartment gradient of a lag or bioavailability map
///
/// Compartments missing from a map take `default`.
pub(crate) fn map_gradient(
    map: fn(&V) -> HashMap<usize, T>,
    perturbation: &ParameterPerturbation,
    default: f64,
) -> HashMap<usize, Vec<f64>> {
    let n_params = perturbation.len();
    let mut gradient: HashMap<usize, Vec<f64>> = HashMap::new();
    for j in 0..n_params {
        let plus = map(&perturbation.plus[j]);
        let minus = map(&perturbation.minus[j]);
        for input in plus.keys().chain(minus.keys()) {
            let up = plus.get(input).copied().unwrap_or(default);
            let down = minus.get(input).copied().unwrap_or(default);
            gradient.entry(*input).or_insert_with(|| vec![0.0; n_params])[j] =
                (up - down) / (2.0 * perturbation.steps[j]);
        }
    }
    gradient
}

/// Gradients of the lag times and bioavailability fractions
#[derive(Debug, Clone, Default)]
pub(crate) struct DosingSensitivity {
    pub(crate) lag: HashMap<usize, Vec<f64>>,
    pub(crate) fa: HashMap<usize, Vec<f64>>,
}

impl DosingSensitivity {
    pub(crate) fn new(lag: Lag, fa: Fa, perturbation: &ParameterPerturbation) -> Self {
        Self {
            lag: map_gradient(lag, perturbation, 0.0),
            fa: map_gradient(fa, perturbation, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn jacobian_of_linear_map() {
        let f = |x: &V, y: &mut V| {
            y[0] = 2.0 * x[0] - x[1];
            y[1] = 3.0 * x[1];
            y[2] = x[0] * x[0];
        };
        let x = V::from_vec(vec![1.5, -2.0]);
        let jac = jacobian(&f, &x, 3, 1e-6);
        assert_relative_eq!(jac[(0, 0)], 2.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(0, 1)], -1.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(1, 1)], 3.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(2, 0)], 3.0, epsilon = 1e-6);
        assert_relative_eq!(jac[(2, 1)], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn bioavailability_gradient() {
        fn fa(p: &V) -> HashMap<usize, T> {
            HashMap::from([(0, p[1] * p[1])])
        }
        let theta = V::from_vec(vec![0.3, 0.5]);
        let perturbation = ParameterPerturbation::new(&theta, 1e-6);
        let gradient = map_gradient(fa, &perturbation, 1.0);
        assert_relative_eq!(gradient[&0][0], 0.0, epsilon = 1e-10);
        assert_relative_eq!(gradient[&0][1], 1.0, epsilon = 1e-6);
        assert!(!gradient.contains_key(&1));
    }

    #[test]
    fn augmented_rhs_for_decay() {
        // dx/dt = -k x  =>  dS/dt = -k S - x
        fn diffeq(x: &V, p: &V, _t: T, dx: &mut V, _rateiv: &V) {
            dx[0] = -p[0] * x[0];
        }
        let theta = V::from_vec(vec![0.2]);
        let perturbation = ParameterPerturbation::new(&theta, 1e-6);
        let rates = V::zeros(1);
        let rates_perturbed = vec![(V::zeros(1), V::zeros(1))];
        let z = V::from_vec(vec![4.0, -1.5]);
        let mut dz = V::zeros(2);
        augmented_rhs(
            diffeq,
            0.0,
            &z,
            &theta,
            &rates,
            &rates_perturbed,
            &perturbation,
            1,
            1e-6,
            &mut dz,
        );
        assert_relative_eq!(dz[0], -0.8, epsilon = 1e-12);
        assert_relative_eq!(dz[1], -0.2 * -1.5 - 4.0, epsilon = 1e-6);
    }
}
