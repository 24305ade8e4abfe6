use approx::assert_relative_eq;
use pkpdinfer::inference::{
    LbfgsOptimiser, NelderMeadOptimiser, OptimisationController, ReducedLogDensity,
    SamplingController, Transform,
};
use pkpdinfer::*;

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

/// Noise-free observations of `100 exp(-0.1 t)`
fn posterior() -> IndividualLogPosterior {
    let mut builder = Subject::builder("1").bolus(0.0, 100.0, 0);
    for t in [0.0f64, 5.0, 10.0] {
        builder = builder.observation(t, 100.0 * (-0.1 * t).exp(), 0);
    }
    let likelihood = IndividualLogLikelihood::new(
        one_compartment(),
        ErrorModels::uniform(ErrorModel::Constant, 1),
        builder.build().unwrap(),
        settings(),
    )
    .unwrap();
    IndividualLogPosterior::new(
        likelihood,
        vec![
            LogPrior::Uniform {
                lower: 0.0,
                upper: 1.0,
            },
            LogPrior::Uniform {
                lower: 0.0,
                upper: 10.0,
            },
        ],
    )
    .unwrap()
}

#[test]
fn fixing_a_parameter_keeps_the_value() {
    let posterior = posterior();
    let reduced = ReducedLogDensity::from_names(&posterior, &[("Sigma", 1.3)]).unwrap();
    assert_eq!(reduced.n_parameters(), posterior.n_parameters() - 1);
    assert_eq!(reduced.parameter_names(), vec!["k"]);
    for k in [0.05, 0.1, 0.2] {
        assert_eq!(
            reduced.evaluate(&[k]).unwrap(),
            posterior.evaluate(&[k, 1.3]).unwrap()
        );
    }
    let (_, gradient) = reduced.evaluate_with_gradient(&[0.12]).unwrap();
    let (_, full) = posterior.evaluate_with_gradient(&[0.12, 1.3]).unwrap();
    assert_eq!(gradient, vec![full[0]]);
}

#[test]
fn log_transform_round_trips() {
    for x in [1e-12, 3e-4, 0.1, 1.0, 42.0, 7.5e9] {
        assert_relative_eq!(
            Transform::Log.inverse(Transform::Log.forward(x)),
            x,
            max_relative = 1e-14
        );
    }
    let logit = Transform::Logit {
        lower: 0.0,
        upper: 10.0,
    };
    for x in [0.01, 2.5, 9.99] {
        assert_relative_eq!(logit.inverse(logit.forward(x)), x, max_relative = 1e-12);
    }
}

#[test]
fn nelder_mead_recovers_the_elimination_rate() {
    let posterior = posterior();
    let result = OptimisationController::new(&posterior, OptimiserSettings::default())
        .fix_parameters(&[("Sigma", 1.0)])
        .unwrap()
        .with_transforms(&[("k", Transform::Log)])
        .unwrap()
        .with_initial_values(vec![vec![0.15, 1.0]])
        .unwrap()
        .with_optimiser(Box::new(NelderMeadOptimiser::default()))
        .run()
        .unwrap();
    let named = result.to_named();
    assert_relative_eq!(named["k"], 0.1, max_relative = 1e-3);
    assert_eq!(named["Sigma"], 1.0);

    let errors = result.standard_errors_named().unwrap();
    assert!(errors["k"] > 0.0 && errors["k"] < 0.01);
    assert_eq!(errors["Sigma"], 0.0);
}

#[test]
fn lbfgs_uses_the_gradient_and_several_starts() {
    let posterior = posterior();
    let settings = OptimiserSettings {
        n_runs: 2,
        ..OptimiserSettings::default()
    };
    let result = OptimisationController::new(&posterior, settings)
        .fix_parameters(&[("Sigma", 1.0)])
        .unwrap()
        .with_transforms(&[("k", Transform::Log)])
        .unwrap()
        .with_initial_values(vec![vec![0.08, 1.0], vec![0.13, 1.0]])
        .unwrap()
        .with_optimiser(Box::new(LbfgsOptimiser::default()))
        .with_standard_errors(false)
        .run()
        .unwrap();
    assert_eq!(result.runs().len(), 2);
    for run in result.runs() {
        assert_relative_eq!(run.parameters[0], 0.1, max_relative = 1e-3);
    }
    assert!(result.standard_errors().is_none());
}

#[test]
fn sampling_concentrates_around_the_truth() {
    let posterior = posterior();
    let settings = SamplerSettings {
        n_iterations: 1500,
        warmup: 500,
        n_chains: 2,
        seed: 3,
        ..SamplerSettings::default()
    };
    let result = SamplingController::new(&posterior, settings)
        .fix_parameters(&[("Sigma", 1.0)])
        .unwrap()
        .with_transforms(&[("k", Transform::Log)])
        .unwrap()
        .with_initial_values(vec![vec![0.12, 1.0], vec![0.09, 1.0]])
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(result.n_chains(), 2);
    assert_eq!(result.chains()[0].len(), 1000);
    let mean = result.mean();
    assert_relative_eq!(mean[0], 0.1, max_relative = 0.05);
    assert_eq!(mean[1], 1.0);
    assert!(result.to_named()["Sigma"].iter().all(|s| *s == 1.0));

    let path = std::env::temp_dir().join("pkpdinfer_sampling_export.csv");
    result.write_csv(&path).unwrap();
    let mut reader = csv::Reader::from_path(&path).unwrap();
    let header: Vec<String> = reader
        .headers()
        .unwrap()
        .iter()
        .map(String::from)
        .collect();
    assert_eq!(header, vec!["chain", "iteration", "log_density", "k", "Sigma"]);
    assert_eq!(reader.records().count(), 2000);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn unknown_parameter_names_are_rejected() {
    let posterior = posterior();
    let result = OptimisationController::new(&posterior, OptimiserSettings::default())
        .fix_parameters(&[("Volume", 1.0)]);
    assert!(matches!(result, Err(ConfigurationError::InvalidMask(_))));
}
