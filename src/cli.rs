use std::path::PathBuf;

use clap::Parser;

/// Parser for the cli options
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Compiles combinatorial system specifications into Boltzmann samplers", long_about = None)]
pub struct Cli {
    /// System specification to compile
    pub input: PathBuf,

    /// Where to write the emitted module (stdout when omitted)
    pub output: Option<PathBuf>,

    /// Singularity bisection precision
    #[arg(short, long, default_value_t = 1e-6)]
    pub precision: f64,

    /// Fixed-point evaluation precision
    #[arg(short, long, default_value_t = 1e-6)]
    pub eps: f64,

    /// User-supplied singularity; skips bisection
    #[arg(short, long)]
    pub sing: Option<f64>,

    /// Identifier of the emitted module (default Main)
    #[arg(short, long)]
    pub module: Option<String>,

    /// External convex-program tuner binary; required for systems with
    /// constructor frequencies
    #[arg(short, long)]
    pub tuner: Option<PathBuf>,

    /// Also write the sampler plan as JSON, for inspection
    #[arg(long, value_name = "PATH")]
    pub dump_plan: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_and_short_flags() {
        let cli = Cli::parse_from(["boltzgen", "trees.sys"]);
        assert!((cli.precision - 1e-6).abs() < f64::EPSILON);
        assert!((cli.eps - 1e-6).abs() < f64::EPSILON);
        assert!(cli.sing.is_none());
        assert!(cli.module.is_none());
        assert!(cli.output.is_none());

        let cli = Cli::parse_from([
            "boltzgen", "-p", "1e-9", "-e", "1e-8", "-s", "0.33333", "-m", "Trees", "trees.sys",
            "Trees.hs",
        ]);
        assert!((cli.precision - 1e-9).abs() < f64::EPSILON);
        assert_eq!(cli.sing, Some(0.33333));
        assert_eq!(cli.module.as_deref(), Some("Trees"));
        assert_eq!(cli.output.unwrap().to_str(), Some("Trees.hs"));
    }
}
