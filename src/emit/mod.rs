//! Renders a sampler plan as a self-contained Haskell module: one data
//! declaration per type, a budget-checked recursive generator, a
//! rejection sampler per type and optional IO entry points bound to the
//! process randomness source.

use std::fmt::Write as _;

use bon::Builder;
use log::info;

use crate::plan::{BranchPlan, Call, ListPlan, SamplerPlan, TypePlan};
use crate::system::System;

#[derive(Builder, Debug, Clone)]
pub struct EmitConf {
    #[builder(default = String::from("Main"))]
    pub module_name: String,
    #[builder(default = true)]
    pub with_io: bool,
    #[builder(default = true)]
    pub with_show: bool,
}

impl Default for EmitConf {
    fn default() -> Self {
        EmitConf::builder().build()
    }
}

impl EmitConf {
    /// Resolves the emitter flags: an explicit module name wins over the
    /// `module` annotation; `withIO` and `withShow` come from the
    /// annotation map and default to true.
    #[must_use]
    pub fn from_annotations(sys: &System, module_override: Option<&str>) -> Self {
        let module_name = module_override
            .or_else(|| sys.annotation("module"))
            .unwrap_or("Main")
            .to_owned();
        EmitConf::builder()
            .module_name(module_name)
            .with_io(sys.annotation_flag("withIO", true))
            .with_show(sys.annotation_flag("withShow", true))
            .build()
    }
}

/// Renders the module source. Total over any valid plan: every
/// referenced generator is declared by the same plan.
#[must_use]
pub fn render(plan: &SamplerPlan, conf: &EmitConf) -> String {
    let mut out = String::new();
    info!(
        "emitting module {} for {} type(s)",
        conf.module_name,
        plan.types.len()
    );

    header(&mut out, plan, conf);
    for ty in plan.types.values() {
        out.push('\n');
        data_decl(&mut out, ty, conf.with_show);
    }
    for ty in plan.types.values() {
        out.push('\n');
        generator(&mut out, ty, plan.interruptible);
    }
    for list in plan.lists.values() {
        out.push('\n');
        list_generator(&mut out, list);
    }
    for name in plan.types.keys() {
        out.push('\n');
        sampler(&mut out, name);
        if conf.with_io {
            out.push('\n');
            io_entry(&mut out, name);
        }
    }
    out
}

/// First-letter capitalisation; keeps emitted identifiers valid Haskell
/// constructors regardless of the input spelling.
fn hs(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn header(out: &mut String, plan: &SamplerPlan, conf: &EmitConf) {
    let _ = writeln!(out, "-- Boltzmann samplers at parameter {:?}.", plan.rho);
    let _ = writeln!(out, "-- Generated by boltzgen; do not edit.");
    let _ = writeln!(out, "module {}", conf.module_name);

    let mut exports = Vec::new();
    for name in plan.types.keys() {
        let ty = hs(name);
        exports.push(format!("{ty}(..)"));
        exports.push(format!("genRandom{ty}"));
        exports.push(format!("sample{ty}"));
        if conf.with_io {
            exports.push(format!("sample{ty}IO"));
        }
    }
    for (i, export) in exports.iter().enumerate() {
        let lead = if i == 0 { '(' } else { ',' };
        let _ = writeln!(out, "  {lead} {export}");
    }
    let _ = writeln!(out, "  ) where");
    out.push('\n');
    let _ = writeln!(out, "import System.Random");
}

fn data_decl(out: &mut String, ty: &TypePlan, with_show: bool) {
    let name = hs(&ty.name);
    for (i, branch) in ty.branches.iter().enumerate() {
        let lead = if i == 0 {
            format!("data {name} =")
        } else {
            " ".repeat(5 + name.len()) + " |"
        };
        let mut fields = String::new();
        for call in &branch.calls {
            match call {
                Call::Ty(u) => {
                    let _ = write!(fields, " {}", hs(u));
                }
                Call::SeqOf(u) => {
                    let _ = write!(fields, " [{}]", hs(u));
                }
            }
        }
        let _ = writeln!(out, "{lead} {}{fields}", hs(&branch.constructor));
    }
    if with_show {
        let _ = writeln!(out, "  deriving (Show)");
    }
}

fn generator(out: &mut String, ty: &TypePlan, interruptible: bool) {
    let name = hs(&ty.name);
    let _ = writeln!(
        out,
        "genRandom{name} :: RandomGen g => g -> Int -> Maybe ({name}, Int, g)"
    );
    let _ = writeln!(out, "genRandom{name} g ub");
    let _ = writeln!(out, "  | ub <= 0 = Nothing");

    if let [branch] = ty.branches.as_slice() {
        let _ = writeln!(out, "  | otherwise =");
        branch_body(out, branch, "g", 6, interruptible);
        return;
    }

    let _ = writeln!(out, "  | otherwise = branch v g'");
    let _ = writeln!(out, "  where");
    let _ = writeln!(out, "    (v, g') = randomR (0.0, 1.0 :: Double) g");
    let _ = writeln!(out, "    branch p g0");
    for branch in &ty.branches {
        match branch.upper {
            Some(upper) => {
                let _ = writeln!(out, "      | p < {upper:?} =");
            }
            None => {
                let _ = writeln!(out, "      | otherwise =");
            }
        }
        branch_body(out, branch, "g0", 10, interruptible);
    }
}

/// Renders the chain of child calls of one branch, threading the
/// remaining budget: call `i` runs with `ub` minus the atoms emitted so
/// far and the sizes of its elder siblings. Interruptible plans guard
/// every weighted branch with a budget check before its atoms are
/// emitted, so their candidates never overshoot the upper bound.
fn branch_body(
    out: &mut String,
    branch: &BranchPlan,
    gen_in: &str,
    indent: usize,
    interruptible: bool,
) {
    let constructor = hs(&branch.constructor);

    let mut indent = indent;
    if interruptible && branch.weight > 0 {
        let pad = " ".repeat(indent);
        let _ = writeln!(out, "{pad}if ub < {}", branch.weight);
        let _ = writeln!(out, "{pad}  then Nothing");
        if branch.calls.is_empty() {
            let _ = writeln!(
                out,
                "{pad}  else Just ({constructor}, {}, {gen_in})",
                branch.weight
            );
            return;
        }
        let _ = writeln!(out, "{pad}  else");
        indent += 4;
    }

    let pad = " ".repeat(indent);
    if branch.calls.is_empty() {
        let _ = writeln!(out, "{pad}Just ({constructor}, {}, {gen_in})", branch.weight);
        return;
    }

    let mut gen = gen_in.to_owned();
    for (i, call) in branch.calls.iter().enumerate() {
        let pad = " ".repeat(indent + 4 * i);
        let callee = match call {
            Call::Ty(u) => format!("genRandom{}", hs(u)),
            Call::SeqOf(u) => format!("genRandom{}List", hs(u)),
        };
        let _ = writeln!(out, "{pad}case {callee} {gen} ({}) of", budget_expr(branch, i));
        let _ = writeln!(out, "{pad}  Nothing -> Nothing");
        let next_gen = format!("g{}", i + 1);
        if i + 1 == branch.calls.len() {
            let _ = writeln!(
                out,
                "{pad}  Just (x{}, s{}, {next_gen}) -> Just ({constructor}{}, {}, {next_gen})",
                i + 1,
                i + 1,
                (1..=branch.calls.len()).fold(String::new(), |mut acc, j| {
                    let _ = write!(acc, " x{j}");
                    acc
                }),
                size_expr(branch),
            );
        } else {
            let _ = writeln!(out, "{pad}  Just (x{}, s{}, {next_gen}) ->", i + 1, i + 1);
        }
        gen = next_gen;
    }
}

fn budget_expr(branch: &BranchPlan, call_index: usize) -> String {
    let mut expr = String::from("ub");
    if branch.weight > 0 {
        let _ = write!(expr, " - {}", branch.weight);
    }
    for j in 1..=call_index {
        let _ = write!(expr, " - s{j}");
    }
    expr
}

fn size_expr(branch: &BranchPlan) -> String {
    let mut terms = Vec::new();
    if branch.weight > 0 || branch.calls.is_empty() {
        terms.push(branch.weight.to_string());
    }
    for j in 1..=branch.calls.len() {
        terms.push(format!("s{j}"));
    }
    terms.join(" + ")
}

fn list_generator(out: &mut String, list: &ListPlan) {
    let elem = hs(&list.elem);
    let _ = writeln!(
        out,
        "genRandom{elem}List :: RandomGen g => g -> Int -> Maybe ([{elem}], Int, g)"
    );
    let _ = writeln!(out, "genRandom{elem}List g ub");
    let _ = writeln!(out, "  | ub <= 0 = Nothing");
    let _ = writeln!(out, "  | otherwise =");
    let _ = writeln!(out, "      let (v, g') = randomR (0.0, 1.0 :: Double) g");
    let _ = writeln!(out, "      in if v < {:?}", list.continue_prob);
    let _ = writeln!(out, "           then case genRandom{elem} g' ub of");
    let _ = writeln!(out, "             Nothing -> Nothing");
    let _ = writeln!(
        out,
        "             Just (x, s, g0) -> case genRandom{elem}List g0 (ub - s) of"
    );
    let _ = writeln!(out, "               Nothing -> Nothing");
    let _ = writeln!(
        out,
        "               Just (xs, ss, g1) -> Just (x : xs, s + ss, g1)"
    );
    let _ = writeln!(out, "           else Just ([], 0, g')");
}

fn sampler(out: &mut String, name: &str) {
    let ty = hs(name);
    let _ = writeln!(
        out,
        "sample{ty} :: RandomGen g => g -> Int -> Int -> ({ty}, g)"
    );
    let _ = writeln!(out, "sample{ty} g lb ub");
    let _ = writeln!(out, "  | lb > ub = error \"sample{ty}: empty size window\"");
    let _ = writeln!(out, "  | otherwise = go g");
    let _ = writeln!(out, "  where");
    let _ = writeln!(out, "    go g0 =");
    let _ = writeln!(out, "      let (g1, g2) = split g0");
    let _ = writeln!(out, "      in case genRandom{ty} g1 ub of");
    let _ = writeln!(out, "        Just (x, s, _) | s >= lb && s <= ub -> (x, g2)");
    let _ = writeln!(out, "        _ -> go g2");
}

fn io_entry(out: &mut String, name: &str) {
    let ty = hs(name);
    let _ = writeln!(out, "sample{ty}IO :: Int -> Int -> IO {ty}");
    let _ = writeln!(out, "sample{ty}IO lb ub = do");
    let _ = writeln!(out, "  g <- newStdGen");
    let _ = writeln!(out, "  return (fst (sample{ty} g lb ub))");
}
