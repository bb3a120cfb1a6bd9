use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use log::info;

use boltzgen::analysis::{self, Class};
use boltzgen::cli::Cli;
use boltzgen::emit::{self, EmitConf};
use boltzgen::errors::BoltzError;
use boltzgen::io;
use boltzgen::oracle::{self, OracleConf};
use boltzgen::plan;
use boltzgen::system::parse::parse_system;
use boltzgen::tuner::TunerBridge;

fn main() -> ExitCode {
    env_logger::init();
    let start_time = Local::now();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("boltzgen: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = Local::now() - start_time;
    info!(
        "Runtime: {:0>2}:{:0>2}:{:0>2}",
        runtime.num_hours(),
        runtime.num_minutes() % 60,
        runtime.num_seconds() % 60
    );
    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<(), BoltzError> {
    let source = io::read_input(&cli.input)?;
    let system = parse_system(&source)?;
    info!("parsed {} type(s) from {}", system.len(), cli.input.display());

    let class = analysis::classify(&system);
    info!("system classified as {class:?}");

    // the tuner accepts any classification; only the internal oracle is
    // restricted to rational and algebraic systems
    let parametrised = match &cli.tuner {
        Some(solver) => TunerBridge::new(solver).tune(&system, &class)?,
        None => {
            if let Class::Unsupported(reason) = &class {
                return Err(BoltzError::Unsupported(reason.clone()));
            }
            let conf = OracleConf::builder()
                .precision(cli.precision)
                .eps(cli.eps)
                .maybe_sing(cli.sing)
                .build();
            oracle::run(&system, &conf)?
        }
    };
    info!("tuned at parameter {}", parametrised.rho);

    let sampler_plan = plan::build(&parametrised, &class);
    if let Some(path) = &cli.dump_plan {
        let json = serde_json::to_string_pretty(&sampler_plan).expect("plan serialises");
        io::write_output(Some(path), &json)?;
    }

    let conf = EmitConf::from_annotations(&system, cli.module.as_deref());
    let module = emit::render(&sampler_plan, &conf);

    io::write_output(cli.output.as_deref(), &module)?;
    Ok(())
}
