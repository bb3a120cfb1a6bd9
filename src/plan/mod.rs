//! Sampler planner: turns a parametrised system into an abstract plan a
//! backend can render. Branch selection is a cumulative-probability
//! table in constructor order with the last branch as fallthrough; each
//! branch emits its atoms and threads the remaining size budget through
//! its child calls.

pub mod sim;

use indexmap::IndexMap;
use serde::Serialize;

use crate::analysis::{self, Class};
use crate::system::{Arg, ParametrisedSystem};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ty(String),
    SeqOf(String),
}

#[derive(Serialize, Debug, Clone)]
pub struct BranchPlan {
    pub constructor: String,
    /// Cumulative probability bound; `None` marks the fallthrough branch.
    pub upper: Option<f64>,
    pub weight: u64,
    pub calls: Vec<Call>,
}

#[derive(Serialize, Debug, Clone)]
pub struct TypePlan {
    pub name: String,
    pub branches: Vec<BranchPlan>,
}

/// Geometric list generator: at each step the sampler draws another
/// element with probability `continue_prob`, the element type's
/// generating-function value at the tuned parameter.
#[derive(Serialize, Debug, Clone)]
pub struct ListPlan {
    pub elem: String,
    pub continue_prob: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct SamplerPlan {
    pub rho: f64,
    pub interruptible: bool,
    pub types: IndexMap<String, TypePlan>,
    pub lists: IndexMap<String, ListPlan>,
}

#[must_use]
pub fn build(par: &ParametrisedSystem, class: &Class) -> SamplerPlan {
    let sys = &par.system;

    let types = sys
        .types()
        .map(|(name, cons)| {
            let probs = &par.branching[name];
            let mut cumulative = 0.0;
            let mut branches = Vec::with_capacity(cons.len());
            for (i, con) in cons.iter().enumerate() {
                cumulative += probs[i];
                let upper = if i + 1 == cons.len() {
                    None
                } else {
                    Some(cumulative)
                };
                let calls = con
                    .args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Ty(t) => Call::Ty(t.clone()),
                        Arg::Seq(t) => Call::SeqOf(t.clone()),
                    })
                    .collect();
                branches.push(BranchPlan {
                    constructor: con.name.clone(),
                    upper,
                    weight: con.weight,
                    calls,
                });
            }
            (
                name.to_owned(),
                TypePlan {
                    name: name.to_owned(),
                    branches,
                },
            )
        })
        .collect();

    let lists = analysis::seq_types(sys)
        .into_iter()
        .map(|elem| {
            let continue_prob = par.value(&elem).expect("validated reference");
            debug_assert!((0.0..1.0).contains(&continue_prob));
            (
                elem.clone(),
                ListPlan {
                    elem,
                    continue_prob,
                },
            )
        })
        .collect();

    SamplerPlan {
        rho: par.rho,
        interruptible: *class == Class::Rational,
        types,
        lists,
    }
}
