pub mod parse;

use indexmap::IndexMap;
use log::warn;
use ordered_float::OrderedFloat;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("type {0} has no constructors")]
    EmptyType(String),
    #[error("duplicate constructor name {0}")]
    DuplicateConstructor(String),
    #[error("constructor {0} references unknown type {1}")]
    UnknownType(String, String),
    #[error("frequency of {0} must be positive and finite, got {1}")]
    BadFrequency(String, f64),
}

/// A constructor argument. Sequence arguments reference the element type;
/// the sequence type itself exists only as a derived vertex of the
/// dependency graph and as a synthesised generator downstream.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    Ty(String),
    Seq(String),
}

impl Arg {
    #[must_use]
    pub fn referenced(&self) -> &str {
        match self {
            Arg::Ty(name) | Arg::Seq(name) => name,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constructor {
    pub name: String,
    pub args: Vec<Arg>,
    /// Number of atoms this constructor contributes to the size of a
    /// generated object.
    pub weight: u64,
    /// Target relative frequency, only meaningful under the external tuner.
    pub frequency: Option<OrderedFloat<f64>>,
}

impl Constructor {
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.args.is_empty()
    }
}

/// A weighted combinatorial system: an ordered mapping from type name to a
/// non-empty list of constructors, plus free-form preamble annotations.
///
/// Validated on construction and immutable afterwards.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct System {
    types: IndexMap<String, Vec<Constructor>>,
    annotations: IndexMap<String, String>,
}

impl System {
    /// Builds a validated system.
    ///
    /// # Errors
    ///
    /// Rejects empty constructor lists, duplicate constructor names,
    /// references to undefined types and non-positive or non-finite
    /// frequencies.
    pub fn new(
        types: IndexMap<String, Vec<Constructor>>,
        annotations: IndexMap<String, String>,
    ) -> Result<Self, SystemError> {
        let mut seen = hashbrown::HashSet::new();
        for (name, constructors) in &types {
            if constructors.is_empty() {
                return Err(SystemError::EmptyType(name.clone()));
            }
            for con in constructors {
                if !seen.insert(con.name.as_str()) {
                    return Err(SystemError::DuplicateConstructor(con.name.clone()));
                }
                for arg in &con.args {
                    if !types.contains_key(arg.referenced()) {
                        return Err(SystemError::UnknownType(
                            con.name.clone(),
                            arg.referenced().to_owned(),
                        ));
                    }
                }
                if let Some(freq) = con.frequency {
                    if !(freq.0.is_finite() && freq.0 > 0.0) {
                        return Err(SystemError::BadFrequency(con.name.clone(), freq.0));
                    }
                }
            }
        }
        drop(seen);
        Ok(System { types, annotations })
    }

    pub fn types(&self) -> impl Iterator<Item = (&str, &[Constructor])> {
        self.types
            .iter()
            .map(|(name, cons)| (name.as_str(), cons.as_slice()))
    }

    #[must_use]
    pub fn constructors(&self, name: &str) -> Option<&[Constructor]> {
        self.types.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn type_index(&self, name: &str) -> Option<usize> {
        self.types.get_index_of(name)
    }

    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn annotations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.annotations
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Coerces an annotation value to a flag. Recognised tokens are `true`
    /// and `false`, case-insensitive; anything else keeps the default.
    #[must_use]
    pub fn annotation_flag(&self, key: &str, default: bool) -> bool {
        match self.annotation(key) {
            None => default,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => {
                    warn!("annotation {key}: unrecognised value {other:?}, keeping {default}");
                    default
                }
            },
        }
    }

    /// Frequencies of marked constructors, in constructor-traversal order.
    #[must_use]
    pub fn frequencies(&self) -> Vec<f64> {
        self.types
            .values()
            .flatten()
            .filter_map(|con| con.frequency.map(|f| f.0))
            .collect()
    }

    #[must_use]
    pub fn has_frequencies(&self) -> bool {
        self.types
            .values()
            .flatten()
            .any(|con| con.frequency.is_some())
    }
}

/// A system evaluated at a Boltzmann parameter: the singularity
/// approximation, per-type generating-function values and per-constructor
/// branching probabilities (in constructor order, summing to 1 per type
/// within oracle tolerance). The integer-weight system is retained.
#[derive(Serialize, Debug, Clone)]
pub struct ParametrisedSystem {
    pub system: System,
    pub rho: f64,
    pub values: IndexMap<String, f64>,
    pub branching: IndexMap<String, Vec<f64>>,
}

impl ParametrisedSystem {
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}
