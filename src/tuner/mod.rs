//! Bridge to the external convex-program tuner.
//!
//! The internal oracle cannot jointly solve for the marking multipliers
//! of frequency-annotated constructors; such systems are serialised as a
//! convex program and handed to an external solver. The whole
//! specification is written to the child's stdin before anything is read
//! back, so the exchange cannot deadlock, and the child is waited on
//! explicitly.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use indexmap::IndexMap;
use log::{debug, info};
use thiserror::Error;

use crate::analysis::{self, Class};
use crate::system::{Arg, ParametrisedSystem, System};

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("failed to launch tuner at {path}: {source}")]
    SpawnFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to exchange data with the tuner: {0}")]
    Exchange(#[from] std::io::Error),
    #[error("tuner exited with status {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },
    #[error("failed to parse tuner output: {0}")]
    ParseError(String),
    #[error("tuner did not yield finite values")]
    Rejected,
}

/// Numeric wire form of a system: a header with the vertex and frequency
/// counts, the frequency targets, then one block per vertex holding one
/// row per constructor. Each row lists the weight, the frequency marks
/// and the reference counts into every vertex (types first, then
/// sequence vertices). Sequence vertices close the stream as two-row
/// blocks encoding `SEQ(x) = 1 + x * SEQ(x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireSpec {
    pub frequencies: Vec<f64>,
    pub types: Vec<Vec<WireRow>>,
    pub seqs: Vec<Vec<WireRow>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRow {
    pub weight: u64,
    pub marks: Vec<u64>,
    pub type_refs: Vec<u64>,
    pub seq_refs: Vec<u64>,
}

impl WireRow {
    fn zero(num_freqs: usize, num_types: usize, num_seqs: usize) -> Self {
        WireRow {
            weight: 0,
            marks: vec![0; num_freqs],
            type_refs: vec![0; num_types],
            seq_refs: vec![0; num_seqs],
        }
    }

    fn is_zero(&self) -> bool {
        self.weight == 0
            && self.marks.iter().all(|&m| m == 0)
            && self.type_refs.iter().all(|&r| r == 0)
            && self.seq_refs.iter().all(|&r| r == 0)
    }
}

impl WireSpec {
    #[must_use]
    pub fn from_system(sys: &System) -> Self {
        let seqs = analysis::seq_types(sys);
        let num_types = sys.len();
        let num_seqs = seqs.len();

        let frequencies = sys.frequencies();
        let num_freqs = frequencies.len();

        let mut freq_index = 0usize;
        let types = sys
            .types()
            .map(|(_, cons)| {
                cons.iter()
                    .map(|con| {
                        let mut row = WireRow::zero(num_freqs, num_types, num_seqs);
                        row.weight = con.weight;
                        if con.frequency.is_some() {
                            row.marks[freq_index] = con.weight;
                            freq_index += 1;
                        }
                        for arg in &con.args {
                            match arg {
                                Arg::Ty(t) => {
                                    row.type_refs
                                        [sys.type_index(t).expect("validated reference")] += 1;
                                }
                                Arg::Seq(t) => {
                                    row.seq_refs
                                        [seqs.get_index_of(t).expect("derived sequence")] += 1;
                                }
                            }
                        }
                        row
                    })
                    .collect()
            })
            .collect();

        let seq_blocks = seqs
            .iter()
            .enumerate()
            .map(|(seq_index, elem)| {
                let empty = WireRow::zero(num_freqs, num_types, num_seqs);
                let mut step = empty.clone();
                step.type_refs[sys.type_index(elem).expect("validated reference")] = 1;
                step.seq_refs[seq_index] = 1;
                vec![empty, step]
            })
            .collect();

        WireSpec {
            frequencies,
            types,
            seqs: seq_blocks,
        }
    }

    /// Parses a specification back from its textual wire form. The
    /// type/sequence split is not part of the header; the trailing
    /// sequence blocks are recognised by their fixed two-row shape.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ParseError`] on any token or shape mismatch.
    pub fn decode(input: &str) -> Result<Self, TunerError> {
        let mut tokens = input.split_whitespace();
        let mut next_int = |what: &str| -> Result<u64, TunerError> {
            tokens
                .next()
                .ok_or_else(|| TunerError::ParseError(format!("missing {what}")))?
                .parse::<u64>()
                .map_err(|e| TunerError::ParseError(format!("bad {what}: {e}")))
        };
        let to_usize =
            |v: u64| usize::try_from(v).map_err(|e| TunerError::ParseError(e.to_string()));

        let total = to_usize(next_int("vertex count")?)?;
        let num_freqs = to_usize(next_int("frequency count")?)?;

        // frequencies are the only non-integer tokens
        drop(next_int);
        let mut tokens = input.split_whitespace().skip(2);
        let mut frequencies = Vec::with_capacity(num_freqs);
        for _ in 0..num_freqs {
            let token = tokens
                .next()
                .ok_or_else(|| TunerError::ParseError("missing frequency".to_owned()))?;
            frequencies.push(
                token
                    .parse::<f64>()
                    .map_err(|e| TunerError::ParseError(format!("bad frequency: {e}")))?,
            );
        }

        let mut next_int = |what: &str| -> Result<u64, TunerError> {
            tokens
                .next()
                .ok_or_else(|| TunerError::ParseError(format!("missing {what}")))?
                .parse::<u64>()
                .map_err(|e| TunerError::ParseError(format!("bad {what}: {e}")))
        };

        // every row spans the full vertex set, so its width is known
        // before the type/sequence split is
        let mut blocks = Vec::with_capacity(total);
        for _ in 0..total {
            let rows = to_usize(next_int("constructor count")?)?;
            if rows == 0 {
                return Err(TunerError::ParseError("empty constructor block".to_owned()));
            }
            let mut block = Vec::with_capacity(rows);
            for _ in 0..rows {
                let weight = next_int("weight")?;
                let mut marks = Vec::with_capacity(num_freqs);
                for _ in 0..num_freqs {
                    marks.push(next_int("mark")?);
                }
                let mut refs = Vec::with_capacity(total);
                for _ in 0..total {
                    refs.push(next_int("reference")?);
                }
                block.push((weight, marks, refs));
            }
            blocks.push(block);
        }
        drop(next_int);
        if tokens.next().is_some() {
            return Err(TunerError::ParseError("trailing tokens".to_owned()));
        }

        let num_seqs = trailing_sequence_blocks(&blocks);
        let num_types = total - num_seqs;

        let split = |block: &[(u64, Vec<u64>, Vec<u64>)]| {
            block
                .iter()
                .map(|(weight, marks, refs)| WireRow {
                    weight: *weight,
                    marks: marks.clone(),
                    type_refs: refs[..num_types].to_vec(),
                    seq_refs: refs[num_types..].to_vec(),
                })
                .collect::<Vec<_>>()
        };

        Ok(WireSpec {
            frequencies,
            types: blocks[..num_types].iter().map(|b| split(b)).collect(),
            seqs: blocks[num_types..].iter().map(|b| split(b)).collect(),
        })
    }
}

/// Counts the trailing blocks shaped like `SEQ(x) = 1 + x * SEQ(x)`:
/// two rows, the first empty, the second weightless with a self
/// reference and exactly one element reference.
fn trailing_sequence_blocks(blocks: &[Vec<(u64, Vec<u64>, Vec<u64>)>]) -> usize {
    let total = blocks.len();
    let mut count = 0;
    for (vertex, block) in blocks.iter().enumerate().rev() {
        let [empty, step] = block.as_slice() else {
            break;
        };
        let empty_ok =
            empty.0 == 0 && empty.1.iter().all(|&m| m == 0) && empty.2.iter().all(|&r| r == 0);
        let step_ok = step.0 == 0
            && step.1.iter().all(|&m| m == 0)
            && step.2.get(vertex) == Some(&1)
            && step.2.iter().sum::<u64>() == 2;
        if empty_ok && step_ok {
            count += 1;
        } else {
            break;
        }
    }
    debug_assert!(count <= total);
    count
}

impl fmt::Display for WireSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}",
            self.types.len() + self.seqs.len(),
            self.frequencies.len()
        )?;
        if !self.frequencies.is_empty() {
            let freqs: Vec<String> = self.frequencies.iter().map(f64::to_string).collect();
            writeln!(f, "{}", freqs.join(" "))?;
        }
        for block in self.types.iter().chain(&self.seqs) {
            writeln!(f, "{}", block.len())?;
            for row in block {
                let mut fields = vec![row.weight.to_string()];
                fields.extend(row.marks.iter().map(u64::to_string));
                fields.extend(row.type_refs.iter().map(u64::to_string));
                fields.extend(row.seq_refs.iter().map(u64::to_string));
                writeln!(f, "{}", fields.join(" "))?;
            }
        }
        Ok(())
    }
}

/// Wraps the external solver binary.
pub struct TunerBridge {
    solver_path: PathBuf,
}

impl TunerBridge {
    #[must_use]
    pub fn new(solver_path: impl AsRef<Path>) -> Self {
        TunerBridge {
            solver_path: solver_path.as_ref().to_path_buf(),
        }
    }

    /// Tunes the system: writes the wire specification to the solver,
    /// reads back the singularity, the marking multipliers and the type
    /// values, and converts them into a parametrised system.
    ///
    /// # Errors
    ///
    /// See [`TunerError`].
    pub fn tune(&self, sys: &System, class: &Class) -> Result<ParametrisedSystem, TunerError> {
        let spec = WireSpec::from_system(sys);
        let payload = spec.to_string();
        debug!("tuner payload:\n{payload}");

        let (solver, iters, kind) = match class {
            Class::Rational => ("interior-point", 2500, "rational"),
            Class::Algebraic | Class::Unsupported(_) => ("conic", 20, "algebraic"),
        };
        info!("launching tuner {} ({solver}, {kind})", self.solver_path.display());

        let mut child = Command::new(&self.solver_path)
            .arg("--solver")
            .arg(solver)
            .arg("--precision")
            .arg("1e-20")
            .arg("--max-iters")
            .arg(iters.to_string())
            .arg("--system")
            .arg(kind)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TunerError::SpawnFailed {
                path: self.solver_path.clone(),
                source,
            })?;

        // write the whole specification, then drop the write side before
        // reading anything back
        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(payload.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(TunerError::ProcessFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (rho, multipliers, values) =
            parse_solution(&stdout, spec.frequencies.len(), sys.len())?;
        debug!("tuner solution: rho {rho}, multipliers {multipliers:?}, values {values:?}");

        parametrise(sys, rho, &multipliers, &values)
    }
}

fn parse_solution(
    output: &str,
    num_freqs: usize,
    num_types: usize,
) -> Result<(f64, Vec<f64>, Vec<f64>), TunerError> {
    let mut tokens = output.split_whitespace();
    let mut next = |what: &str| -> Result<f64, TunerError> {
        tokens
            .next()
            .ok_or_else(|| TunerError::ParseError(format!("missing {what}")))?
            .parse::<f64>()
            .map_err(|e| TunerError::ParseError(format!("bad {what}: {e}")))
    };

    let rho = next("singularity")?;
    let multipliers = (0..num_freqs)
        .map(|_| next("multiplier"))
        .collect::<Result<Vec<_>, _>>()?;
    let values = (0..num_types)
        .map(|_| next("type value"))
        .collect::<Result<Vec<_>, _>>()?;

    if !rho.is_finite()
        || rho <= 0.0
        || multipliers.iter().chain(&values).any(|v| !v.is_finite())
    {
        return Err(TunerError::Rejected);
    }
    Ok((rho, multipliers, values))
}

/// Branching probabilities with marking multipliers applied: a marked
/// constructor of weight `w` at frequency index `k` contributes
/// `u_k^w * rho^w * prod g(arg)`.
fn parametrise(
    sys: &System,
    rho: f64,
    multipliers: &[f64],
    values: &[f64],
) -> Result<ParametrisedSystem, TunerError> {
    let mut value_map = IndexMap::new();
    let mut branching = IndexMap::new();
    let mut freq_index = 0usize;

    for (i, (name, cons)) in sys.types().enumerate() {
        let y_t = values[i];
        let mut probs = Vec::with_capacity(cons.len());
        for con in cons {
            let exponent = i32::try_from(con.weight).unwrap_or(i32::MAX);
            let mut value = rho.powi(exponent);
            if con.frequency.is_some() {
                value *= multipliers[freq_index].powi(exponent);
                freq_index += 1;
            }
            for arg in &con.args {
                let v = values[sys.type_index(arg.referenced()).expect("validated reference")];
                match arg {
                    Arg::Ty(_) => value *= v,
                    Arg::Seq(_) => {
                        if v >= 1.0 {
                            return Err(TunerError::Rejected);
                        }
                        value *= 1.0 / (1.0 - v);
                    }
                }
            }
            let p = value / y_t;
            if !p.is_finite() {
                return Err(TunerError::Rejected);
            }
            probs.push(p);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::parse::parse_system;

    #[test]
    fn wire_roundtrip_plain_system() {
        let sys = parse_system("M = Leaf | Unary M | Binary M M.").unwrap();
        let spec = WireSpec::from_system(&sys);
        let decoded = WireSpec::decode(&spec.to_string()).unwrap();
        assert_eq!(spec, decoded);
    }

    #[test]
    fn wire_roundtrip_with_sequences_and_frequencies() {
        let sys = parse_system(
            "T = Node A [T] [0.25] | Tip (0).\n\
             A = Atom.",
        )
        .unwrap();
        let spec = WireSpec::from_system(&sys);
        assert_eq!(spec.frequencies, vec![0.25]);
        assert_eq!(spec.types.len(), 2);
        assert_eq!(spec.seqs.len(), 1);

        let decoded = WireSpec::decode(&spec.to_string()).unwrap();
        assert_eq!(spec, decoded);
    }

    #[test]
    fn marks_sit_at_the_frequency_index() {
        let sys = parse_system("T = Heavy T (2) [0.5] | Light T | Stop (0).").unwrap();
        let spec = WireSpec::from_system(&sys);
        let rows = &spec.types[0];
        // the marked constructor carries its weight at its frequency slot
        assert_eq!(rows[0].marks, vec![2]);
        assert_eq!(rows[1].marks, vec![0]);
        assert_eq!(rows[0].weight, 2);
    }

    #[test]
    fn sequence_block_encodes_the_geometric_equation() {
        let sys = parse_system("A = Wrap [B].\nB = Atom.").unwrap();
        let spec = WireSpec::from_system(&sys);
        let block = &spec.seqs[0];
        assert!(block[0].is_zero());
        assert_eq!(block[1].weight, 0);
        assert_eq!(block[1].type_refs, vec![0, 1]);
        assert_eq!(block[1].seq_refs, vec![1]);
    }

    #[test]
    fn missing_solver_is_a_spawn_failure() {
        let sys = parse_system("M = Leaf | Unary M [0.4] | Binary M M.").unwrap();
        let class = crate::analysis::classify(&sys);
        let bridge = TunerBridge::new("/nonexistent/path/to/solver");
        let err = bridge.tune(&sys, &class).unwrap_err();
        assert!(matches!(err, TunerError::SpawnFailed { .. }));
    }

    #[test]
    fn solution_parsing_checks_shape_and_finiteness() {
        assert!(parse_solution("0.25 1.5 0.8 0.3", 2, 1).is_ok());
        assert!(matches!(
            parse_solution("0.25 1.5", 2, 1),
            Err(TunerError::ParseError(_))
        ));
        assert!(matches!(
            parse_solution("inf 1.0 1.0 1.0", 2, 1),
            Err(TunerError::Rejected)
        ));
    }

    #[test]
    fn parametrise_applies_multipliers_to_marked_constructors() {
        let sys = parse_system("T = Zero T [0.2] | One T | Eps (0).").unwrap();
        // y = u z y + z y + 1; with u = 0.5, z = 0.5 the value is 4
        let par = parametrise(&sys, 0.5, &[0.5], &[4.0]).unwrap();
        let probs = &par.branching["T"];
        assert!((probs[0] - 0.25).abs() < 1e-12);
        assert!((probs[1] - 0.5).abs() < 1e-12);
        assert!((probs[2] - 0.25).abs() < 1e-12);
    }
}
