use clap::{Arg, ArgMatches, Command};
use colored::*;
use log::info;
use std::path::Path;

mod circuit;
mod cli;
mod element;
mod error;
mod mna;
mod output;
mod parser;
mod simulator;
mod solver;
mod transient;

use crate::cli::{CliArgs, OutputFormat};
use crate::simulator::Simulator;

fn main() {
    let matches = create_cli().get_matches();
    init_logging(matches.get_count("verbose"));

    if let Err(e) = run_application(&matches) {
        eprintln!("{}", format!("Error: {e:#}").red());
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("VoltSim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A SPICE-style analog circuit simulator with a DAE transient engine")
        .arg(
            Arg::new("input")
                .help("Input SPICE netlist file; the analysis comes from its .OP/.DC/.TRAN directive")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Also export the results to a file"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .default_value("csv")
                .value_parser(["csv", "json"])
                .help("File export format"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("Increase verbosity level (stderr)"),
        )
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.init();
}

fn run_application(matches: &ArgMatches) -> anyhow::Result<()> {
    let args = CliArgs::from_matches(matches)?;

    if !Path::new(&args.input_file).exists() {
        anyhow::bail!("input file '{}' not found", args.input_file);
    }

    let simulator = Simulator::new();
    let result = simulator.run_file(&args.input_file)?;

    if let Some(output_file) = &args.output_file {
        match args.output_format {
            OutputFormat::Csv => output::export_csv(&result, output_file)?,
            OutputFormat::Json => output::export_json(&result, output_file)?,
        }
        info!("results exported to {}", output_file.bright_green());
    }

    Ok(())
}
