use approx::assert_relative_eq;
use pkpdinfer::*;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

fn one_compartment() -> MechanisticModel {
    MechanisticModel::new(
        |x, p, _t, dx, rateiv| {
            fetch_params!(p, k);
            dx[0] = -k * x[0] + rateiv[0];
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

fn settings() -> SolverSettings {
    SolverSettings::default().with_tolerances(1e-10, 1e-12)
}

fn subject_with_offsets(offsets: [f64; 3]) -> Subject {
    let mut builder = Subject::builder("1").bolus(0.0, 100.0, 0);
    for (t, offset) in [0.0f64, 5.0, 10.0].iter().zip(offsets) {
        builder = builder.observation(*t, 100.0 * (-0.1 * t).exp() + offset, 0);
    }
    builder.build().unwrap()
}

fn gaussian_log_density(residuals: &[f64], sigma: f64) -> f64 {
    residuals
        .iter()
        .map(|r| -LN_SQRT_2PI - sigma.ln() - 0.5 * (r / sigma).powi(2))
        .sum()
}

#[test]
fn exact_observations_give_the_gaussian_normaliser() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets([0.0; 3]),
        settings(),
    )
    .unwrap();
    assert_eq!(likelihood.parameter_names(), vec!["k", "Sigma"]);
    let value = likelihood.evaluate(&[0.1, 1.0]).unwrap();
    assert_relative_eq!(value, gaussian_log_density(&[0.0; 3], 1.0), epsilon = 1e-7);
}

#[test]
fn residuals_follow_the_closed_form() {
    let offsets = [0.5, -1.0, 2.0];
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets(offsets),
        settings(),
    )
    .unwrap();
    for sigma in [1.0, 2.5] {
        let value = likelihood.evaluate(&[0.1, sigma]).unwrap();
        assert_relative_eq!(
            value,
            gaussian_log_density(&offsets, sigma),
            epsilon = 1e-6
        );
    }
}

#[test]
fn gradient_matches_finite_differences() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Combined, 1),
        subject_with_offsets([0.5, -1.0, 2.0]),
        settings(),
    )
    .unwrap();
    let x = vec![0.12, 0.8, 0.05];
    let (value, gradient) = likelihood.evaluate_with_gradient(&x).unwrap();
    assert_relative_eq!(value, likelihood.evaluate(&x).unwrap(), epsilon = 1e-9);
    for j in 0..x.len() {
        let h = 1e-6;
        let mut plus = x.clone();
        let mut minus = x.clone();
        plus[j] += h;
        minus[j] -= h;
        let fd = (likelihood.evaluate(&plus).unwrap() - likelihood.evaluate(&minus).unwrap())
            / (2.0 * h);
        assert_relative_eq!(gradient[j], fd, max_relative = 1e-4, epsilon = 1e-5);
    }
}

#[test]
fn invalid_noise_gives_negative_infinity() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets([0.0; 3]),
        settings(),
    )
    .unwrap();
    assert_eq!(likelihood.evaluate(&[0.1, -1.0]).unwrap(), f64::NEG_INFINITY);
    let (value, gradient) = likelihood.evaluate_with_gradient(&[0.1, 0.0]).unwrap();
    assert_eq!(value, f64::NEG_INFINITY);
    assert_eq!(gradient, vec![0.0, 0.0]);
}

#[test]
fn failed_simulation_gives_negative_infinity() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets([0.0; 3]),
        settings().with_max_steps(1),
    )
    .unwrap();
    assert_eq!(likelihood.evaluate(&[0.1, 1.0]).unwrap(), f64::NEG_INFINITY);
}

#[test]
fn wrong_parameter_count_propagates() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets([0.0; 3]),
        settings(),
    )
    .unwrap();
    assert!(matches!(
        likelihood.evaluate(&[0.1]),
        Err(PkpdError::Configuration(_))
    ));
}

#[test]
fn observation_of_a_missing_output_is_rejected() {
    let subject = Subject::builder("1")
        .bolus(0.0, 100.0, 0)
        .observation(1.0, 90.0, 1)
        .build()
        .unwrap();
    let result = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject,
        settings(),
    );
    assert!(result.is_err());
}

#[test]
fn posterior_adds_the_priors() {
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        subject_with_offsets([0.5, -1.0, 2.0]),
        settings(),
    )
    .unwrap();
    let priors = vec![
        LogPrior::Uniform {
            lower: 0.0,
            upper: 1.0,
        },
        LogPrior::HalfCauchy {
            location: 0.0,
            scale: 1.0,
        },
    ];
    let posterior = IndividualLogPosterior::new(likelihood.clone(), priors.clone()).unwrap();
    let x = [0.1, 1.5];
    let expected =
        likelihood.evaluate(&x).unwrap() + priors[0].log_pdf(x[0]) + priors[1].log_pdf(x[1]);
    assert_relative_eq!(posterior.evaluate(&x).unwrap(), expected, epsilon = 1e-12);
    assert_eq!(posterior.evaluate(&[1.5, 1.5]).unwrap(), f64::NEG_INFINITY);
}
