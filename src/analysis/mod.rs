//! Structural analysis of combinatorial systems: derived sets, the
//! dependency graph and the rational/algebraic classification that
//! decides which sampler specialisation can be compiled.

use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::system::{Arg, System};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Class {
    /// Linear, interruptible and strongly connected: compiles to a
    /// sampler over a linear recurrence.
    Rational,
    /// Permits sequence arguments and multiple non-atomic references.
    Algebraic,
    Unsupported(String),
}

/// Vertex of the dependency graph. Sequence types are derived vertices,
/// one per element type referenced through a sequence argument.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vertex {
    Ty(String),
    Seq(String),
}

/// Types all of whose constructors are atomic.
#[must_use]
pub fn atomic_types(sys: &System) -> HashSet<String> {
    sys.types()
        .filter(|(_, cons)| cons.iter().all(crate::system::Constructor::is_atomic))
        .map(|(name, _)| name.to_owned())
        .collect()
}

/// Element types referenced through a sequence argument, in first-use
/// order. The order is load-bearing: the tuner wire format and the
/// emitted list generators both follow it.
#[must_use]
pub fn seq_types(sys: &System) -> IndexSet<String> {
    sys.types()
        .flat_map(|(_, cons)| cons)
        .flat_map(|con| &con.args)
        .filter_map(|arg| match arg {
            Arg::Seq(elem) => Some(elem.clone()),
            Arg::Ty(_) => None,
        })
        .collect()
}

/// Whether the system has at least one atomic constructor. Without one
/// the generating functions are degenerate and no sampler terminates.
#[must_use]
pub fn has_atoms(sys: &System) -> bool {
    sys.types()
        .flat_map(|(_, cons)| cons)
        .any(crate::system::Constructor::is_atomic)
}

/// Builds the dependency graph over types and derived sequence types.
///
/// Each constructor of `u` contributes an edge `u -> referenced`; edges
/// into atomic types are mirrored so that terminal atoms stay inside the
/// component that consumes them. Each sequence type carries a self-loop
/// and an edge to its element type.
#[must_use]
pub fn dependency_graph(sys: &System) -> DiGraph<Vertex, ()> {
    let atomics = atomic_types(sys);
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<Vertex, NodeIndex> = HashMap::new();

    let mut node = |graph: &mut DiGraph<Vertex, ()>, v: Vertex| {
        *nodes.entry(v.clone()).or_insert_with(|| graph.add_node(v))
    };

    for (name, _) in sys.types() {
        node(&mut graph, Vertex::Ty(name.to_owned()));
    }
    for elem in seq_types(sys) {
        node(&mut graph, Vertex::Seq(elem));
    }

    for (name, cons) in sys.types() {
        let from = node(&mut graph, Vertex::Ty(name.to_owned()));
        for con in cons {
            for arg in &con.args {
                let to = match arg {
                    Arg::Ty(t) => node(&mut graph, Vertex::Ty(t.clone())),
                    Arg::Seq(t) => node(&mut graph, Vertex::Seq(t.clone())),
                };
                graph.update_edge(from, to, ());
                if let Arg::Ty(t) = arg {
                    if atomics.contains(t) {
                        graph.update_edge(to, from, ());
                    }
                }
            }
        }
    }

    for elem in seq_types(sys) {
        let seq = node(&mut graph, Vertex::Seq(elem.clone()));
        let ty = node(&mut graph, Vertex::Ty(elem));
        graph.update_edge(seq, seq, ());
        graph.update_edge(seq, ty, ());
    }

    graph
}

/// Classifies a validated system.
///
/// A system is rational when every constructor is linear (no sequence
/// argument, at most one non-atomic reference), every constructor's
/// argument list holds at most one atomic reference (so the size budget
/// can be re-checked on each descent), and the dependency graph forms a
/// single strongly connected component. Non-linear systems are
/// algebraic; everything else is unsupported with a recorded reason.
#[must_use]
pub fn classify(sys: &System) -> Class {
    let atomics = atomic_types(sys);

    let linear = sys.types().flat_map(|(_, cons)| cons).all(|con| {
        let non_atomic = con
            .args
            .iter()
            .filter(|arg| match arg {
                Arg::Ty(t) => !atomics.contains(t),
                Arg::Seq(_) => true,
            })
            .count();
        !con.args.iter().any(|a| matches!(a, Arg::Seq(_))) && non_atomic <= 1
    });

    if !linear {
        return Class::Algebraic;
    }

    let interruptible = sys.types().flat_map(|(_, cons)| cons).all(|con| {
        con.args
            .iter()
            .filter(|arg| matches!(arg, Arg::Ty(t) if atomics.contains(t)))
            .count()
            <= 1
    });
    if !interruptible {
        return Class::Unsupported("not interruptible".to_owned());
    }

    let components = tarjan_scc(&dependency_graph(sys)).len();
    if components == 1 {
        Class::Rational
    } else {
        Class::Unsupported(format!("{components} strongly connected components"))
    }
}
