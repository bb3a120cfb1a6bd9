use hashbrown::HashMap;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;

use boltzgen::analysis::{classify, Class};
use boltzgen::emit::{self, EmitConf};
use boltzgen::oracle::{self, OracleConf, OracleError};
use boltzgen::plan::{self, sim};
use boltzgen::system::parse::parse_system;
use boltzgen::tuner::{TunerBridge, TunerError, WireSpec};

const MOTZKIN: &str = "M = Leaf | Unary M | Binary M M.";
const BINARY_WORDS: &str = "T = Zero T | One T | Eps (0).";

#[test]
fn motzkin_compiles_end_to_end() {
    let sys = parse_system(MOTZKIN).unwrap();
    assert_eq!(classify(&sys), Class::Algebraic);

    let par = oracle::run(&sys, &OracleConf::default()).unwrap();
    assert!((par.rho - 1.0 / 3.0).abs() < 1e-5);
    let probs = &par.branching["M"];
    assert!((probs[0] - 0.334).abs() < 2e-3);
    assert!((probs[1] - 0.333).abs() < 2e-3);
    assert!((probs[2] - 0.333).abs() < 2e-3);

    let sampler_plan = plan::build(&par, &classify(&sys));
    let source = emit::render(&sampler_plan, &EmitConf::default());
    assert!(source.contains("module Main"));
    assert!(source.contains("data M = Leaf"));
    assert!(source.contains("genRandomM"));
    assert!(source.contains("sampleM"));
}

#[test]
fn binary_words_compile_as_a_rational_system() {
    let sys = parse_system(BINARY_WORDS).unwrap();
    assert_eq!(classify(&sys), Class::Rational);

    let par = oracle::run(&sys, &OracleConf::default()).unwrap();
    assert!((par.rho - 0.5).abs() < 1e-5);

    let sampler_plan = plan::build(&par, &classify(&sys));
    assert!(sampler_plan.interruptible);
    let source = emit::render(&sampler_plan, &EmitConf::default());
    assert!(source.contains("data T = Zero T"));
    assert!(source.contains("Just (Eps, 0, g0)"));
}

#[test]
fn sequence_of_atoms_needs_a_user_singularity() {
    let input = "A = Wrap [B].\nB = Atom.";
    let sys = parse_system(input).unwrap();

    let err = oracle::run(&sys, &OracleConf::default()).unwrap_err();
    assert!(matches!(err, OracleError::Divergent));

    let conf = OracleConf::builder().sing(0.5).build();
    let par = oracle::run(&sys, &conf).unwrap();
    // y_A = 1 / (1 - y_B) scaled by the atom: z / (1 - z)
    assert!((par.value("A").unwrap() - 1.0).abs() < 1e-4);
    assert!((par.value("B").unwrap() - 0.5).abs() < 1e-9);
}

#[test]
fn user_singularity_skips_bisection_and_honours_eps() {
    let sys = parse_system(MOTZKIN).unwrap();
    let conf = OracleConf::builder().sing(0.33333).eps(1e-10).build();
    let par = oracle::run(&sys, &conf).unwrap();
    assert!((par.rho - 0.33333).abs() < f64::EPSILON);
    let total: f64 = par.branching["M"].iter().sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn disconnected_rational_components_are_unsupported() {
    let sys = parse_system("T = Zero T | Eps (0).\nU = One U | Nil (0).").unwrap();
    assert_eq!(
        classify(&sys),
        Class::Unsupported("2 strongly connected components".to_owned())
    );
}

#[test]
fn sampled_sizes_follow_the_window_and_the_branching_table() {
    let sys = parse_system(MOTZKIN).unwrap();
    let par = oracle::run(&sys, &OracleConf::default()).unwrap();
    let sampler_plan = plan::build(&par, &classify(&sys));

    let mut rng = ChaCha12Rng::seed_from_u64(2024);
    let mut sizes = Vec::new();
    let mut tallies: HashMap<String, u64> = HashMap::new();
    for _ in 0..500 {
        let outcome = sim::sample(&sampler_plan, "M", 10, 1000, &mut rng, 100_000).unwrap();
        assert!(outcome.size >= 10 && outcome.size <= 1000);
        sizes.push(outcome.size);
        for (name, count) in &outcome.tallies {
            *tallies.entry(name.clone()).or_insert(0) += count;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let mean = sizes.iter().sum::<u64>() as f64 / sizes.len() as f64;
    assert!(mean > 10.0 && mean < 1000.0);

    let total: u64 = tallies.values().sum();
    #[allow(clippy::cast_precision_loss)]
    let leaf_share = tallies["Leaf"] as f64 / total as f64;
    assert!((leaf_share - 1.0 / 3.0).abs() < 0.05, "leaf share {leaf_share}");
}

#[test]
fn empty_size_window_is_rejected_not_looped() {
    let sys = parse_system(MOTZKIN).unwrap();
    let par = oracle::run(&sys, &OracleConf::default()).unwrap();
    let sampler_plan = plan::build(&par, &classify(&sys));
    let mut rng = ChaCha12Rng::seed_from_u64(5);
    let err = sim::sample(&sampler_plan, "M", 100, 10, &mut rng, 1000).unwrap_err();
    assert!(matches!(err, sim::SimError::EmptyWindow(100, 10)));
}

#[test]
fn frequencies_are_routed_to_the_tuner() {
    let sys = parse_system("M = Leaf | Unary M [0.4] | Binary M M.").unwrap();

    let err = oracle::run(&sys, &OracleConf::default()).unwrap_err();
    assert!(matches!(err, OracleError::FrequencyWithoutTuner));

    let bridge = TunerBridge::new("/nonexistent/solver");
    let err = bridge.tune(&sys, &classify(&sys)).unwrap_err();
    assert!(matches!(err, TunerError::SpawnFailed { .. }));
}

#[test]
fn unsupported_systems_with_frequencies_still_reach_the_tuner() {
    // two disconnected components with a frequency mark: outside the
    // internal oracle's reach but within the tuner contract
    let sys = parse_system("T = Zero T [0.3] | Eps (0).\nU = One U | Nil (0).").unwrap();
    let class = classify(&sys);
    assert!(matches!(class, Class::Unsupported(_)));

    let bridge = TunerBridge::new("/nonexistent/solver");
    let err = bridge.tune(&sys, &class).unwrap_err();
    assert!(matches!(err, TunerError::SpawnFailed { .. }));
}

#[test]
fn tuner_wire_format_roundtrips() {
    let input = "\
@module Marked

T = Node A [T] [0.25] | Tip.
A = Atom.
";
    let sys = parse_system(input).unwrap();
    let spec = WireSpec::from_system(&sys);
    let text = spec.to_string();
    let decoded = WireSpec::decode(&text).unwrap();
    assert_eq!(spec, decoded);
    assert_eq!(decoded.to_string(), text);
}

#[test]
fn annotations_reach_the_emitted_module() {
    let input = "\
@module Words
@withIO false
@withShow false

T = Zero T | One T | Eps (0).
";
    let sys = parse_system(input).unwrap();
    let par = oracle::run(&sys, &OracleConf::default()).unwrap();
    let sampler_plan = plan::build(&par, &classify(&sys));
    let source = emit::render(&sampler_plan, &EmitConf::from_annotations(&sys, None));
    assert!(source.contains("module Words"));
    assert!(!source.contains("sampleTIO"));
    assert!(!source.contains("deriving (Show)"));
}
