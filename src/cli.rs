use anyhow::{anyhow, Result};
use clap::ArgMatches;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_file: String,
    pub output_file: Option<String>,
    pub output_format: OutputFormat,
    pub verbose_level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input_file = matches
            .get_one::<String>("input")
            .ok_or_else(|| anyhow!("netlist file is required"))?
            .clone();

        let output_file = matches.get_one::<String>("output").cloned();
        let verbose_level = matches.get_count("verbose");

        let output_format = match matches.get_one::<String>("format").unwrap().as_str() {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            other => return Err(anyhow!("invalid output format '{other}'")),
        };

        Ok(CliArgs {
            input_file,
            output_file,
            output_format,
            verbose_level,
        })
    }
}
