use std::io::Write;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::output;
use crate::parser::{Analysis, ParsedNetlist, SpiceParser};
use crate::solver::{run_dc_sweep, DcSolver};
use crate::transient::TransientSolver;

/// Tabulated outcome of one analysis run, kept around for file export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    /// "op", "dc_sweep" or "transient".
    pub analysis: String,
    /// First CSV column: "Time", the sweep source name, or "" for .OP.
    pub key_column: String,
    /// Ordered unknown names.
    pub columns: Vec<String>,
    /// One entry per emitted row: (key value, unknown values).
    pub rows: Vec<(f64, Vec<f64>)>,
}

/// Front door of the engine: parse a netlist, dispatch the registered
/// analysis, stream rows to stdout as they are produced, and hand back the
/// collected result.
pub struct Simulator;

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Simulator
    }

    pub fn run_file(&self, path: &str) -> Result<SimulationResult> {
        info!("loading netlist from {path}");
        let parsed = SpiceParser::new().parse_file(path)?;
        self.run_parsed(parsed)
    }

    pub fn run_netlist(&self, content: &str) -> Result<SimulationResult> {
        let parsed = SpiceParser::new().parse_netlist(content)?;
        self.run_parsed(parsed)
    }

    /// Rows already written to stdout before a solve failure are preserved;
    /// the failure is returned to the caller for the exit status.
    pub fn run_parsed(&self, parsed: ParsedNetlist) -> Result<SimulationResult> {
        let ParsedNetlist {
            mut circuit,
            analysis,
        } = parsed;
        let columns = circuit.unknown_names();

        match analysis {
            Analysis::Operating => {
                info!("running DC operating-point analysis");
                let mut solver = DcSolver::new(&circuit)?;
                let y0 = circuit.initial_guess();
                let (y, stats) = solver.solve(&circuit, y0, "operating point")?;
                info!(
                    "operating point converged in {} iterations (residual {:.3e})",
                    stats.iterations, stats.residual_norm
                );

                let values: Vec<f64> = y.iter().copied().collect();
                output::print_op_dump(&columns, &values);
                Ok(SimulationResult {
                    analysis: "op".into(),
                    key_column: String::new(),
                    columns,
                    rows: vec![(0.0, values)],
                })
            }

            Analysis::DcSweep { ref source, .. } => {
                info!("running DC sweep of {source}");
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", output::csv_header(source, &columns));

                let mut rows = Vec::new();
                let source_name = source.clone();
                run_dc_sweep(&mut circuit, &analysis, |value, y| {
                    let values: Vec<f64> = y.iter().copied().collect();
                    let _ = writeln!(out, "{}", output::csv_row(value, &values));
                    rows.push((value, values));
                })?;

                Ok(SimulationResult {
                    analysis: "dc_sweep".into(),
                    key_column: source_name,
                    columns,
                    rows,
                })
            }

            Analysis::Transient(spec) => {
                info!(
                    "running transient analysis to t = {:.3e} (output step {:.3e}{})",
                    spec.stop_time,
                    spec.output_step,
                    if spec.uic { ", UIC" } else { "" }
                );
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", output::csv_header("Time", &columns));

                let mut rows = Vec::new();
                let mut solver = TransientSolver::new(&circuit, spec)?;
                solver.run(|t, y| {
                    let values: Vec<f64> = y.iter().copied().collect();
                    let _ = writeln!(out, "{}", output::csv_row(t, &values));
                    rows.push((t, values));
                })?;

                Ok(SimulationResult {
                    analysis: "transient".into(),
                    key_column: "Time".into(),
                    columns,
                    rows,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_result_shape() {
        let result = Simulator::new()
            .run_netlist(
                "V1 in 0 10\n\
                 R1 in out 1k\n\
                 R2 out 0 1k\n\
                 .OP\n.END\n",
            )
            .unwrap();
        assert_eq!(result.analysis, "op");
        assert_eq!(result.columns, vec!["V(in)", "V(out)", "I(V1)"]);
        assert_eq!(result.rows.len(), 1);
        let values = &result.rows[0].1;
        assert!((values[0] - 10.0).abs() < 1e-8);
        assert!((values[1] - 5.0).abs() < 1e-8);
        assert!((values[2] + 5e-3).abs() < 1e-8);
    }

    #[test]
    fn test_sweep_result_rows() {
        let result = Simulator::new()
            .run_netlist(
                "V1 a 0 0\n\
                 R1 a 0 1k\n\
                 .DC V1 0 1 0.5\n\
                 .END\n",
            )
            .unwrap();
        assert_eq!(result.analysis, "dc_sweep");
        assert_eq!(result.key_column, "V1");
        assert_eq!(result.rows.len(), 3);
    }

    #[test]
    fn test_transient_row_count() {
        let result = Simulator::new()
            .run_netlist(
                "V1 a 0 1\n\
                 R1 a b 1k\n\
                 C1 b 0 1u\n\
                 .TRAN 0.5m 2m\n\
                 .END\n",
            )
            .unwrap();
        assert_eq!(result.analysis, "transient");
        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.rows[0].0, 0.0);
        assert_eq!(result.rows.last().unwrap().0, 2e-3);
    }

    #[test]
    fn test_result_serializes() {
        let result = Simulator::new()
            .run_netlist("V1 a 0 1\nR1 a 0 1k\n.OP\n.END\n")
            .unwrap();
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"op\""));
    }
}
