//! Dry-run interpreter for sampler plans.
//!
//! Executes a plan directly against a seeded RNG with the same budget
//! and rejection semantics the emitted code renders. Used to validate
//! branching behaviour and the size-window contract without compiling
//! the generated module.

use hashbrown::HashMap;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use thiserror::Error;

use super::{Call, SamplerPlan};

#[derive(Error, Debug)]
pub enum SimError {
    #[error("empty size window: lower bound {0} exceeds upper bound {1}")]
    EmptyWindow(u64, u64),
    #[error("unknown type {0}")]
    UnknownType(String),
    #[error("no candidate of size in [{0}, {1}] after {2} attempts")]
    RetriesExhausted(u64, u64, usize),
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub size: u64,
    pub tallies: HashMap<String, u64>,
    pub attempts: usize,
}

// the budget cannot stop weightless self-recursion, so cap the depth
// below what the thread stack tolerates
const MAX_DEPTH: usize = 10_000;

/// Draws one object of `ty` with size in `[lb, ub]`, retrying rejected
/// candidates the way the emitted sampler does.
///
/// # Errors
///
/// Fails on an empty window, an unknown type, or when `max_attempts`
/// candidates were all rejected.
pub fn sample(
    plan: &SamplerPlan,
    ty: &str,
    lb: u64,
    ub: u64,
    rng: &mut ChaCha12Rng,
    max_attempts: usize,
) -> Result<Outcome, SimError> {
    if lb > ub {
        return Err(SimError::EmptyWindow(lb, ub));
    }
    if !plan.types.contains_key(ty) {
        return Err(SimError::UnknownType(ty.to_owned()));
    }

    for attempt in 1..=max_attempts {
        let mut tallies = HashMap::new();
        if let Some(size) = gen_type(plan, ty, i128::from(ub), rng, &mut tallies, 0) {
            if size >= lb && size <= ub {
                return Ok(Outcome {
                    size,
                    tallies,
                    attempts: attempt,
                });
            }
        }
    }
    Err(SimError::RetriesExhausted(lb, ub, max_attempts))
}

fn gen_type(
    plan: &SamplerPlan,
    ty: &str,
    budget: i128,
    rng: &mut ChaCha12Rng,
    tallies: &mut HashMap<String, u64>,
    depth: usize,
) -> Option<u64> {
    if budget <= 0 || depth > MAX_DEPTH {
        return None;
    }

    let branches = &plan.types[ty].branches;
    let p: f64 = rng.gen();
    let branch = branches
        .iter()
        .find(|b| b.upper.map_or(true, |upper| p < upper))
        .expect("last branch is fallthrough");

    // interruptible plans re-check the budget before emitting atoms, so
    // candidates of rational systems never overshoot the upper bound
    if plan.interruptible && i128::from(branch.weight) > budget {
        return None;
    }

    *tallies.entry(branch.constructor.clone()).or_insert(0) += 1;
    let mut size = branch.weight;
    for call in &branch.calls {
        let remaining = budget - i128::from(size);
        let produced = match call {
            Call::Ty(u) => gen_type(plan, u, remaining, rng, tallies, depth + 1)?,
            Call::SeqOf(u) => gen_list(plan, u, remaining, rng, tallies, depth + 1)?,
        };
        size += produced;
    }
    Some(size)
}

fn gen_list(
    plan: &SamplerPlan,
    elem: &str,
    budget: i128,
    rng: &mut ChaCha12Rng,
    tallies: &mut HashMap<String, u64>,
    depth: usize,
) -> Option<u64> {
    if budget <= 0 || depth > MAX_DEPTH {
        return None;
    }
    let p: f64 = rng.gen();
    if p >= plan.lists[elem].continue_prob {
        return Some(0);
    }
    let head = gen_type(plan, elem, budget, rng, tallies, depth + 1)?;
    let tail = gen_list(plan, elem, budget - i128::from(head), rng, tallies, depth + 1)?;
    Some(head + tail)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::analysis::classify;
    use crate::oracle::{self, OracleConf};
    use crate::plan;
    use crate::system::parse::parse_system;

    fn motzkin_plan() -> SamplerPlan {
        let sys = parse_system("M = Leaf | Unary M | Binary M M.").unwrap();
        let par = oracle::run(&sys, &OracleConf::default()).unwrap();
        plan::build(&par, &classify(&sys))
    }

    #[test]
    fn sampled_sizes_stay_in_the_window() {
        let plan = motzkin_plan();
        let mut rng = ChaCha12Rng::seed_from_u64(2024);
        for _ in 0..200 {
            let outcome = sample(&plan, "M", 10, 1000, &mut rng, 100_000).unwrap();
            assert!(outcome.size >= 10 && outcome.size <= 1000);
        }
    }

    #[test]
    fn leaves_exceed_internal_nodes_by_one_in_binary_trees() {
        // sanity of the tallies: in a Motzkin tree,
        // #Leaf = #Binary + 1 always holds
        let plan = motzkin_plan();
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let outcome = sample(&plan, "M", 20, 500, &mut rng, 100_000).unwrap();
        let leaves = outcome.tallies.get("Leaf").copied().unwrap_or(0);
        let binaries = outcome.tallies.get("Binary").copied().unwrap_or(0);
        assert_eq!(leaves, binaries + 1);
    }

    #[test]
    fn branching_matches_the_boltzmann_table() {
        let plan = motzkin_plan();
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let mut totals: HashMap<String, u64> = HashMap::new();
        let mut draws = 0u64;
        for _ in 0..300 {
            let outcome = sample(&plan, "M", 1, 2000, &mut rng, 100_000).unwrap();
            for (name, count) in &outcome.tallies {
                *totals.entry(name.clone()).or_insert(0) += count;
                draws += count;
            }
        }
        // every constructor draw follows the same branching table, so the
        // empirical shares track it up to rejection bias
        let share = |name: &str| {
            #[allow(clippy::cast_precision_loss)]
            {
                totals.get(name).copied().unwrap_or(0) as f64 / draws as f64
            }
        };
        assert!((share("Leaf") - 1.0 / 3.0).abs() < 0.08, "{}", share("Leaf"));
        assert!((share("Unary") - 1.0 / 3.0).abs() < 0.08);
        assert!((share("Binary") - 1.0 / 3.0).abs() < 0.08);
    }

    #[test]
    fn empty_window_is_rejected() {
        let plan = motzkin_plan();
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let err = sample(&plan, "M", 10, 5, &mut rng, 10).unwrap_err();
        assert!(matches!(err, SimError::EmptyWindow(10, 5)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let plan = motzkin_plan();
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let err = sample(&plan, "Nope", 1, 10, &mut rng, 10).unwrap_err();
        assert!(matches!(err, SimError::UnknownType(_)));
    }

    #[test]
    fn interruptible_plans_abort_before_overweight_atoms() {
        let sys = parse_system("T = Big (3) | Chain T | End.").unwrap();
        let par = oracle::run(&sys, &OracleConf::builder().sing(0.5).build()).unwrap();
        let sampler_plan = plan::build(&par, &classify(&sys));
        assert!(sampler_plan.interruptible);

        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for _ in 0..100 {
            let outcome = sample(&sampler_plan, "T", 1, 4, &mut rng, 100_000).unwrap();
            assert!(outcome.size >= 1 && outcome.size <= 4);
        }
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let plan = motzkin_plan();
        let a = sample(&plan, "M", 5, 200, &mut ChaCha12Rng::seed_from_u64(99), 100_000)
            .unwrap()
            .size;
        let b = sample(&plan, "M", 5, 200, &mut ChaCha12Rng::seed_from_u64(99), 100_000)
            .unwrap()
            .size;
        assert_eq!(a, b);
    }
}
