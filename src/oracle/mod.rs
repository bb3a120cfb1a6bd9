//! Internal numerical oracle.
//!
//! Evaluates the generating-function system `y = Phi(z, y)` by iterated
//! fixed point and locates the dominant singularity by bisection. The
//! bisection runs on exact rationals (components are rounded to dyadic
//! rationals with a 256-bit denominator, about 77 significant decimal
//! digits) so that tight precision targets do not stall on the limits of
//! double arithmetic. Once the singularity is fixed, type values and
//! branching probabilities are recomputed in double precision.

use bon::Builder;
use indexmap::IndexMap;
use log::{debug, info, warn};
use num::{BigInt, BigRational, One, Signed, ToPrimitive, Zero};
use thiserror::Error;

use crate::analysis;
use crate::system::{Arg, ParametrisedSystem, System};

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("no convergent parameter interval could be bracketed")]
    Divergent,
    #[error("evaluation diverges at {0}")]
    DivergentAt(f64),
    #[error("non-finite value during fixed-point evaluation")]
    NonFinite,
    #[error("system has no atomic constructor")]
    NoAtoms,
    #[error("constructor frequencies require the external tuner")]
    FrequencyWithoutTuner,
}

#[derive(Builder, Debug, Clone)]
pub struct OracleConf {
    /// Bisection precision for the singularity approximation.
    #[builder(default = 1e-6)]
    pub precision: f64,
    /// Convergence threshold for fixed-point evaluation.
    #[builder(default = 1e-6)]
    pub eps: f64,
    /// User-supplied singularity; present means evaluate once, no bisection.
    pub sing: Option<f64>,
}

impl Default for OracleConf {
    fn default() -> Self {
        OracleConf::builder().build()
    }
}

/// Dyadic rounding denominator, in bits.
const ROUND_BITS: u64 = 256;
/// Iteration cap for the exact evaluation; a stall is treated as
/// divergence, which keeps the bracketing invariant intact.
const MAX_ITERATIONS: usize = 500_000;
/// Iteration cap for the double-precision evaluation.
const MAX_ITERATIONS_F64: usize = 50_000_000;
/// Doubling seed for the initial divergent bracket.
const BRACKET_SEED: f64 = 1e-6;
/// Beyond this parameter the generating functions are taken to be entire.
const BRACKET_CAP: f64 = 1e4;
/// Consecutive stable delta ratios required before extrapolating.
const STABLE_ITERS: usize = 4;
/// Iterations to wait after a failed extrapolation attempt.
const COOLDOWN: usize = 256;

pub(crate) enum Fix {
    Converged(Vec<f64>),
    Diverged,
}

/// Runs the oracle over a validated system.
///
/// # Errors
///
/// See [`OracleError`]; systems with frequency marks are rejected here
/// and must go through the tuner bridge.
pub fn run(sys: &System, conf: &OracleConf) -> Result<ParametrisedSystem, OracleError> {
    if sys.has_frequencies() {
        return Err(OracleError::FrequencyWithoutTuner);
    }
    if !analysis::has_atoms(sys) {
        return Err(OracleError::NoAtoms);
    }

    let (rho, values) = match conf.sing {
        Some(sing) => {
            info!("evaluating at user-supplied singularity {sing}");
            if !sing.is_finite() || sing <= 0.0 {
                return Err(OracleError::DivergentAt(sing));
            }
            match fixpoint_f64(sys, sing, conf.eps) {
                Fix::Converged(values) => (sing, values),
                Fix::Diverged => return Err(OracleError::DivergentAt(sing)),
            }
        }
        None => {
            info!(
                "locating dominant singularity by bisection, precision {}",
                conf.precision
            );
            find_singularity(sys, conf)?
        }
    };
    debug!("singularity {rho}, type values {values:?}");

    parametrise(sys, rho, &values, conf.eps)
}

/// Converts a converged evaluation into the parametrised system with
/// per-constructor branching probabilities.
///
/// # Errors
///
/// Returns [`OracleError::NonFinite`] when a type value or probability
/// is not a finite non-negative number.
pub fn parametrise(
    sys: &System,
    rho: f64,
    values: &[f64],
    eps: f64,
) -> Result<ParametrisedSystem, OracleError> {
    let mut value_map = IndexMap::new();
    let mut branching = IndexMap::new();

    for (i, (name, cons)) in sys.types().enumerate() {
        let y_t = values[i];
        if !y_t.is_finite() || y_t < 0.0 {
            return Err(OracleError::NonFinite);
        }
        let mut probs = Vec::with_capacity(cons.len());
        for con in cons {
            let mut value = pow_f64(rho, con.weight);
            for arg in &con.args {
                let v = values[sys.type_index(arg.referenced()).expect("validated reference")];
                match arg {
                    Arg::Ty(_) => value *= v,
                    Arg::Seq(_) => value *= 1.0 / (1.0 - v),
                }
            }
            let p = value / y_t;
            if !p.is_finite() {
                return Err(OracleError::NonFinite);
            }
            probs.push(p);
        }
        let total: f64 = probs.iter().sum();
        if (total - 1.0).abs() > 10.0 * eps {
            warn!("branching probabilities of {name} sum to {total}");
        }
        value_map.insert(name.to_owned(), y_t);
        branching.insert(name.to_owned(), probs);
    }

    Ok(ParametrisedSystem {
        system: sys.clone(),
        rho,
        values: value_map,
        branching,
    })
}

/// Bisects for the dominant singularity, maintaining a convergent `lo`
/// and a divergent `hi`.
fn find_singularity(sys: &System, conf: &OracleConf) -> Result<(f64, Vec<f64>), OracleError> {
    if analysis::atomic_types(sys).len() == sys.len() {
        // polynomial generating functions, any parameter is admissible
        info!("all types are atomic; defaulting to parameter 1");
        return match fixpoint_f64(sys, 1.0, conf.eps) {
            Fix::Converged(values) => Ok((1.0, values)),
            Fix::Diverged => Err(OracleError::Divergent),
        };
    }

    let eps = big(conf.eps)?;
    let cutoff = big((1.0 / conf.eps).max(1e6))?;
    let precision = big(conf.precision)?;
    let two = BigRational::from_integer(2.into());

    let mut lo = BigRational::zero();
    let mut hi = big(BRACKET_SEED)?;
    let mut best: Option<Vec<BigRational>> = None;

    loop {
        match fixpoint_big(sys, &hi, &eps, &cutoff) {
            BigFix::Converged(values) => {
                lo = hi.clone();
                best = Some(values);
                hi = hi * &two;
                if hi.to_f64().unwrap_or(f64::INFINITY) > BRACKET_CAP {
                    info!("no singularity below {BRACKET_CAP}; treating the system as entire");
                    return match fixpoint_f64(sys, 1.0, conf.eps) {
                        Fix::Converged(values) => Ok((1.0, values)),
                        Fix::Diverged => Err(OracleError::Divergent),
                    };
                }
            }
            BigFix::Diverged => break,
        }
    }

    while &hi - &lo >= precision {
        let mid = (&lo + &hi) / &two;
        match fixpoint_big(sys, &mid, &eps, &cutoff) {
            BigFix::Converged(values) => {
                best = Some(values);
                lo = mid;
            }
            BigFix::Diverged => hi = mid,
        }
    }

    let rho = lo.to_f64().ok_or(OracleError::NonFinite)?;
    let values = match fixpoint_f64(sys, rho, conf.eps) {
        Fix::Converged(values) => values,
        Fix::Diverged => {
            // rounding the parameter to double can tip the evaluation over
            // the edge; fall back to the last exact values
            best.ok_or(OracleError::Divergent)?
                .iter()
                .map(|v| v.to_f64().ok_or(OracleError::NonFinite))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    // A sequence base sitting on its pole at the singularity means the
    // geometric tail probability reaches 1 there and no sampler
    // terminates; a user-supplied parameter below the pole is required.
    for elem in analysis::seq_types(sys) {
        let base = values[sys.type_index(&elem).expect("validated reference")];
        if base >= 1.0 - 10.0 * conf.precision {
            return Err(OracleError::Divergent);
        }
    }

    Ok((rho, values))
}

/// One application of the generating-function operator in doubles.
/// `None` flags divergence: a sequence base reached 1, or a component
/// went non-finite or past the cutoff.
fn phi_f64(sys: &System, z: f64, y: &[f64], cutoff: f64) -> Option<Vec<f64>> {
    let mut next = Vec::with_capacity(sys.len());
    for (_, cons) in sys.types() {
        let mut total = 0.0;
        for con in cons {
            let mut term = pow_f64(z, con.weight);
            for arg in &con.args {
                let v = y[sys.type_index(arg.referenced()).expect("validated reference")];
                match arg {
                    Arg::Ty(_) => term *= v,
                    Arg::Seq(_) => {
                        if v >= 1.0 {
                            return None;
                        }
                        term *= 1.0 / (1.0 - v);
                    }
                }
            }
            total += term;
        }
        if !total.is_finite() || total >= cutoff {
            return None;
        }
        next.push(total);
    }
    Some(next)
}

pub(crate) fn fixpoint_f64(sys: &System, z: f64, eps: f64) -> Fix {
    let cutoff = (1.0 / eps).max(1e6);
    let mut y = vec![0.0; sys.len()];
    for iteration in 0..MAX_ITERATIONS_F64 {
        let Some(next) = phi_f64(sys, z, &y, cutoff) else {
            return Fix::Diverged;
        };
        let delta = next
            .iter()
            .zip(&y)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        y = next;
        if delta < eps {
            return Fix::Converged(y);
        }
        if iteration == MAX_ITERATIONS_F64 / 2 {
            warn!("evaluation at {z} is converging slowly");
        }
    }
    Fix::Diverged
}

enum BigFix {
    Converged(Vec<BigRational>),
    Diverged,
}

/// Exact counterpart of [`phi_f64`], with dyadic rounding of every
/// component to keep operand sizes bounded.
fn phi_big(
    sys: &System,
    z: &BigRational,
    y: &[BigRational],
    cutoff: &BigRational,
) -> Option<Vec<BigRational>> {
    let one = BigRational::one();
    let mut next = Vec::with_capacity(sys.len());
    for (_, cons) in sys.types() {
        let mut total = BigRational::zero();
        for con in cons {
            let mut term = pow_big(z, con.weight);
            for arg in &con.args {
                let v = &y[sys.type_index(arg.referenced()).expect("validated reference")];
                match arg {
                    Arg::Ty(_) => term = term * v,
                    Arg::Seq(_) => {
                        if v >= &one {
                            return None;
                        }
                        term = term * (&one - v).recip();
                    }
                }
            }
            total = total + term;
        }
        if total.abs() >= *cutoff {
            return None;
        }
        next.push(round_dyadic(&total));
    }
    Some(next)
}

/// Fixed-point evaluation in exact arithmetic.
///
/// Plain iteration is hopeless near a simple pole, where the contraction
/// factor approaches 1 from either side. Once the delta ratio has
/// stabilised the limit is estimated by geometric extrapolation and
/// validated against the fixed-point residual: an extrapolant that
/// satisfies `y = Phi(z, y)` with non-negative components is accepted as
/// converged, one that solves the system with a negative component
/// proves the parameter sits beyond the singularity.
fn fixpoint_big(
    sys: &System,
    z: &BigRational,
    eps: &BigRational,
    cutoff: &BigRational,
) -> BigFix {
    let one = BigRational::one();
    let ratio_tol = BigRational::from_float(1e-9).expect("constant");

    let mut y = vec![BigRational::zero(); sys.len()];
    let mut prev_delta: Option<BigRational> = None;
    let mut prev_ratio: Option<BigRational> = None;
    let mut stable = 0usize;
    let mut cooldown = 0usize;

    for iteration in 0..MAX_ITERATIONS {
        let Some(next) = phi_big(sys, z, &y, cutoff) else {
            return BigFix::Diverged;
        };

        let deltas: Vec<BigRational> = next.iter().zip(&y).map(|(a, b)| a - b).collect();
        let delta = deltas
            .iter()
            .map(num::Signed::abs)
            .max()
            .unwrap_or_else(BigRational::zero);
        if delta < *eps {
            return BigFix::Converged(next);
        }

        if let Some(prev) = &prev_delta {
            if !prev.is_zero() {
                let ratio = &delta / prev;
                if let Some(prev_ratio) = &prev_ratio {
                    if (&ratio - prev_ratio).abs() < ratio_tol {
                        stable += 1;
                    } else {
                        stable = 0;
                    }
                }
                if stable >= STABLE_ITERS && cooldown == 0 && ratio != one {
                    let gain = &ratio / (&one - &ratio);
                    let guess: Vec<BigRational> = next
                        .iter()
                        .zip(&deltas)
                        .map(|(v, d)| round_dyadic(&(v + d * &gain)))
                        .collect();
                    match check_fixed_point(sys, z, &guess, eps, cutoff) {
                        Residual::Fixed => {
                            if guess.iter().any(num::Signed::is_negative) {
                                // the genuine solution has left the positive
                                // cone, so the parameter is past the singularity
                                return BigFix::Diverged;
                            }
                            return BigFix::Converged(guess);
                        }
                        Residual::Off | Residual::Diverged => cooldown = COOLDOWN,
                    }
                }
                prev_ratio = Some(ratio);
            }
        }

        cooldown = cooldown.saturating_sub(1);
        prev_delta = Some(delta);
        y = next;

        if iteration == MAX_ITERATIONS / 2 {
            warn!(
                "evaluation at {} is converging slowly",
                z.to_f64().unwrap_or(f64::NAN)
            );
        }
    }
    BigFix::Diverged
}

enum Residual {
    Fixed,
    Off,
    Diverged,
}

fn check_fixed_point(
    sys: &System,
    z: &BigRational,
    guess: &[BigRational],
    eps: &BigRational,
    cutoff: &BigRational,
) -> Residual {
    match phi_big(sys, z, guess, cutoff) {
        None => Residual::Diverged,
        Some(image) => {
            let residual = image
                .iter()
                .zip(guess)
                .map(|(a, b)| (a - b).abs())
                .max()
                .unwrap_or_else(BigRational::zero);
            if residual < *eps {
                Residual::Fixed
            } else {
                Residual::Off
            }
        }
    }
}

fn round_dyadic(x: &BigRational) -> BigRational {
    let scale = BigInt::one() << ROUND_BITS;
    let scaled = x * BigRational::from_integer(scale.clone());
    BigRational::new(scaled.round().to_integer(), scale)
}

fn pow_big(z: &BigRational, exp: u64) -> BigRational {
    num::pow(
        z.clone(),
        usize::try_from(exp).expect("weight fits a machine word"),
    )
}

fn pow_f64(z: f64, exp: u64) -> f64 {
    z.powi(i32::try_from(exp).unwrap_or(i32::MAX))
}

fn big(x: f64) -> Result<BigRational, OracleError> {
    BigRational::from_float(x).ok_or(OracleError::NonFinite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::parse::parse_system;

    fn motzkin() -> System {
        parse_system("M = Leaf | Unary M | Binary M M.").unwrap()
    }

    fn binary_words() -> System {
        parse_system("T = Zero T | One T | Eps (0).").unwrap()
    }

    #[test]
    fn motzkin_singularity_is_one_third() {
        let par = run(&motzkin(), &OracleConf::default()).unwrap();
        assert!((par.rho - 1.0 / 3.0).abs() < 1e-5, "rho = {}", par.rho);
        let probs = &par.branching["M"];
        assert!((probs[0] - 0.334).abs() < 2e-3);
        assert!((probs[1] - 0.333).abs() < 2e-3);
        assert!((probs[2] - 0.333).abs() < 2e-3);
    }

    #[test]
    fn binary_words_singularity_is_one_half() {
        let par = run(&binary_words(), &OracleConf::default()).unwrap();
        assert!((par.rho - 0.5).abs() < 1e-5, "rho = {}", par.rho);
        // y = 1 / (1 - 2z), so Zero and One each branch with weight z
        let probs = &par.branching["T"];
        assert!((probs[0] - 0.5).abs() < 1e-2);
        assert!((probs[1] - 0.5).abs() < 1e-2);
    }

    #[test]
    fn branching_probabilities_sum_to_one() {
        let conf = OracleConf::default();
        for sys in [motzkin(), binary_words()] {
            let par = run(&sys, &conf).unwrap();
            for (name, probs) in &par.branching {
                let total: f64 = probs.iter().sum();
                assert!(
                    (total - 1.0).abs() < 10.0 * conf.eps,
                    "{name} sums to {total}"
                );
            }
        }
    }

    #[test]
    fn user_singularity_skips_bisection() {
        let conf = OracleConf::builder().sing(0.33333).eps(1e-10).build();
        let par = run(&motzkin(), &conf).unwrap();
        assert!((par.rho - 0.33333).abs() < f64::EPSILON);
        assert!(par.value("M").unwrap() > 0.9);
    }

    #[test]
    fn divergent_user_singularity_is_reported() {
        let conf = OracleConf::builder().sing(0.4).build();
        let err = run(&motzkin(), &conf).unwrap_err();
        assert!(matches!(err, OracleError::DivergentAt(_)));
    }

    #[test]
    fn sequence_of_atoms_diverges_without_user_singularity() {
        let sys = parse_system("A = Wrap [B].\nB = Atom.").unwrap();
        // y_B = z reaches 1 at z = 1, where the sequence operator blows up
        let err = run(&sys, &OracleConf::default()).unwrap_err();
        assert!(matches!(err, OracleError::Divergent));
    }

    #[test]
    fn sequence_of_atoms_accepts_small_user_singularity() {
        let sys = parse_system("A = Wrap [B].\nB = Atom.").unwrap();
        let conf = OracleConf::builder().sing(0.5).build();
        let par = run(&sys, &conf).unwrap();
        // y_A = z / (1 - z)
        assert!((par.value("A").unwrap() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn purely_atomic_system_defaults_to_one() {
        let sys = parse_system("T = Short (1) | Long (3).").unwrap();
        let par = run(&sys, &OracleConf::default()).unwrap();
        assert!((par.rho - 1.0).abs() < f64::EPSILON);
        assert!((par.value("T").unwrap() - 2.0).abs() < 1e-6);
        let probs = &par.branching["T"];
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn frequencies_require_the_tuner() {
        let sys = parse_system("M = Leaf | Unary M [0.4] | Binary M M.").unwrap();
        let err = run(&sys, &OracleConf::default()).unwrap_err();
        assert!(matches!(err, OracleError::FrequencyWithoutTuner));
    }

    #[test]
    fn no_atoms_is_rejected() {
        let sys = parse_system("T = Pair T T.").unwrap();
        let err = run(&sys, &OracleConf::default()).unwrap_err();
        assert!(matches!(err, OracleError::NoAtoms));
    }

    #[test]
    fn convergence_is_monotone_below_the_singularity() {
        let sys = motzkin();
        for z in [0.05, 0.15, 0.25, 0.33] {
            assert!(matches!(
                fixpoint_f64(&sys, z, 1e-6),
                Fix::Converged(_)
            ));
        }
        for z in [0.34, 0.4, 0.8] {
            assert!(matches!(fixpoint_f64(&sys, z, 1e-6), Fix::Diverged));
        }
    }

    #[test]
    fn dyadic_rounding_is_close() {
        let x = BigRational::new(1.into(), 3.into());
        let rounded = round_dyadic(&x);
        let err = (&rounded - &x).abs();
        assert!(err < BigRational::from_float(1e-50).unwrap());
    }
}
