use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::circuit::Circuit;
use crate::error::{Result, SimError};
use crate::mna::MnaSystem;
use crate::parser::Analysis;

/// Newton-Raphson configuration for the DC solves.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Convergence threshold on the L2 norm of the residual.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            tolerance: 1e-9,
            max_iterations: 50,
        }
    }
}

/// Per-solve statistics, mostly for logging and tests.
#[derive(Debug, Clone)]
pub struct NewtonStats {
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Dense LU solve of A x = b; the linear-algebra black box everything else
/// builds on. A singular factorization reports the circuit as degenerate.
pub fn solve_dense(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    a.clone().lu().solve(b).ok_or(SimError::LinearSolveFailed)
}

/// Newton-Raphson solver for the DC system F(y) = 0.
///
/// Owns its MNA workspace so repeated solves (operating point re-use, sweep
/// continuation) allocate nothing per call.
pub struct DcSolver {
    config: SolverConfig,
    sys: MnaSystem,
}

impl DcSolver {
    pub fn new(circuit: &Circuit) -> Result<Self> {
        Ok(DcSolver {
            config: SolverConfig::default(),
            sys: MnaSystem::new(circuit)?,
        })
    }

    pub fn with_config(circuit: &Circuit, config: SolverConfig) -> Result<Self> {
        Ok(DcSolver {
            config,
            sys: MnaSystem::new(circuit)?,
        })
    }

    /// Run Newton iterations from the given starting point. `context`
    /// labels failures ("operating point", "sweep point V1 = 0.35", ...).
    pub fn solve(
        &mut self,
        circuit: &Circuit,
        mut y: DVector<f64>,
        context: &str,
    ) -> Result<(DVector<f64>, NewtonStats)> {
        let mut norm = self.sys.dc_residual(circuit, &y);

        for iter in 0..self.config.max_iterations {
            debug!("[dc] iter {iter} residual norm = {norm:.3e}");
            if norm < self.config.tolerance {
                return Ok((
                    y,
                    NewtonStats {
                        iterations: iter,
                        residual_norm: norm,
                    },
                ));
            }

            let rhs = self.sys.residual() * -1.0;
            let jac = self.sys.dc_jacobian(circuit, &mut y);
            let delta = solve_dense(jac, &rhs)?;
            y += delta;

            norm = self.sys.dc_residual(circuit, &y);
        }

        if norm < self.config.tolerance {
            return Ok((
                y,
                NewtonStats {
                    iterations: self.config.max_iterations,
                    residual_norm: norm,
                },
            ));
        }
        Err(SimError::DidNotConverge {
            iterations: self.config.max_iterations,
            residual: norm,
            context: context.to_string(),
        })
    }
}

/// DC sweep driver: sets the swept source to each grid value and re-runs
/// Newton warm-started from the previous point. `on_point` receives every
/// converged point in order; the first failure aborts the sweep after the
/// rows already emitted.
pub fn run_dc_sweep(
    circuit: &mut Circuit,
    analysis: &Analysis,
    mut on_point: impl FnMut(f64, &DVector<f64>),
) -> Result<()> {
    let Analysis::DcSweep {
        source,
        start,
        stop,
        increment,
    } = analysis
    else {
        unreachable!("run_dc_sweep called without a sweep analysis");
    };

    let source_idx = circuit
        .find_element(source)
        .expect("sweep source resolved at parse time");

    // Count-based grid so float accumulation cannot drop the final point.
    let num_points = ((stop - start) / increment + 1e-9).floor() as usize + 1;
    debug!("[sweep] {source}: {num_points} points from {start} to {stop}");

    let mut solver = DcSolver::new(circuit)?;
    let mut y = circuit.initial_guess();

    for i in 0..num_points {
        let value = start + i as f64 * increment;
        circuit.set_source_value(source_idx, value);

        let context = format!("sweep point {source} = {value}");
        match solver.solve(circuit, y.clone(), &context) {
            Ok((solution, stats)) => {
                debug!(
                    "[sweep] {source} = {value}: converged in {} iterations",
                    stats.iterations
                );
                on_point(value, &solution);
                y = solution; // continuation for the next point
            }
            Err(e) => {
                warn!("[sweep] aborting at {source} = {value}");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SpiceParser;

    fn parse(netlist: &str) -> (Circuit, Analysis) {
        let parsed = SpiceParser::new().parse_netlist(netlist).unwrap();
        (parsed.circuit, parsed.analysis)
    }

    fn solve_op(netlist: &str) -> (Circuit, DVector<f64>) {
        let (circuit, _) = parse(netlist);
        let mut solver = DcSolver::new(&circuit).unwrap();
        let y0 = circuit.initial_guess();
        let (y, _) = solver.solve(&circuit, y0, "operating point").unwrap();
        (circuit, y)
    }

    fn value(circuit: &Circuit, y: &DVector<f64>, name: &str) -> f64 {
        let idx = circuit
            .unknown_names()
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("unknown {name}"));
        y[idx]
    }

    #[test]
    fn test_resistive_divider() {
        let (c, y) = solve_op(
            "V1 in 0 10\n\
             R1 in out 1k\n\
             R2 out 0 1k\n\
             .OP\n.END\n",
        );
        assert!((value(&c, &y, "V(in)") - 10.0).abs() < 1e-8);
        assert!((value(&c, &y, "V(out)") - 5.0).abs() < 1e-8);
        assert!((value(&c, &y, "I(V1)") + 5e-3).abs() < 1e-8);
    }

    #[test]
    fn test_current_source_into_resistor() {
        let (c, y) = solve_op(
            "I1 a 0 1m\n\
             R1 a 0 1k\n\
             .OP\n.END\n",
        );
        // Injection convention: I flows into the first node.
        assert!((value(&c, &y, "V(a)") - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_inductor_is_dc_short() {
        let (c, y) = solve_op(
            "V1 a 0 1\n\
             R1 a b 10\n\
             L1 b 0 1m\n\
             .OP\n.END\n",
        );
        assert!(value(&c, &y, "V(b)").abs() < 1e-6);
        assert!((value(&c, &y, "I(L1)") - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_capacitor_is_dc_open() {
        let (c, y) = solve_op(
            "V1 a 0 5\n\
             R1 a b 1k\n\
             C1 b 0 1u\n\
             .OP\n.END\n",
        );
        // The 1 MOhm DC stand-in leaves b a divider tap at ~5 * 1e6/(1e6+1e3).
        let expected = 5.0 * 1e6 / (1e6 + 1e3);
        assert!((value(&c, &y, "V(b)") - expected).abs() < 1e-6);
    }

    #[test]
    fn test_vcvs_gain() {
        let (c, y) = solve_op(
            "V1 a 0 2\n\
             R1 a 0 1k\n\
             E1 o 0 a 0 5\n\
             R2 o 0 1k\n\
             .OP\n.END\n",
        );
        assert!((value(&c, &y, "V(o)") - 10.0).abs() < 1e-8);
    }

    #[test]
    fn test_vccs_gain() {
        let (c, y) = solve_op(
            "V1 a 0 1\n\
             R1 a 0 1k\n\
             G1 o 0 a 0 2m\n\
             R2 o 0 1k\n\
             .OP\n.END\n",
        );
        // 2 mS * 1 V injected into 1k.
        assert!((value(&c, &y, "V(o)") - 2.0).abs() < 1e-8);
    }

    #[test]
    fn test_ccvs_and_cccs() {
        let (c, y) = solve_op(
            "V1 a 0 1\n\
             R1 a 0 1k\n\
             H1 o 0 V1 1k\n\
             R2 o 0 1k\n\
             F1 p 0 V1 2\n\
             R3 p 0 1k\n\
             .OP\n.END\n",
        );
        // I(V1) = -1 mA (it sources 1 mA into R1).
        assert!((value(&c, &y, "I(V1)") + 1e-3).abs() < 1e-8);
        // CCVS: 1k * -1mA = -1 V across R2.
        assert!((value(&c, &y, "V(o)") + 1.0).abs() < 1e-7);
        // CCCS: 2 * -1mA injected into R3.
        assert!((value(&c, &y, "V(p)") + 2.0).abs() < 1e-7);
    }

    #[test]
    fn test_diode_matches_shifted_shockley() {
        let (c, y) = solve_op(
            "V1 a 0 0.8\n\
             R1 a 0 10k\n\
             D1 a 0 0.7\n\
             .OP\n.END\n",
        );
        // I(V1) carries the resistor current plus the diode current at
        // Vd = 0.8 under the shifted-knee model.
        let i_d = 1e-14 * (((0.8 - 0.7) / 0.02585_f64).exp() - 1.0);
        let i_r = 0.8 / 10e3;
        let iv = value(&c, &y, "I(V1)");
        assert!((iv + i_r + i_d).abs() < 1e-9, "I(V1) = {iv}");
    }

    #[test]
    fn test_linearity_in_sources() {
        let base = "R1 in out 1k\n\
                    R2 out 0 2k\n\
                    I1 out 0 1m\n\
                    .OP\n.END\n";
        let (c1, y1) = solve_op(&format!("V1 in 0 5\n{base}"));
        let (c2, y2) = solve_op(&format!("V1 in 0 10\n{}", base.replace("I1 out 0 1m", "I1 out 0 2m")));
        for name in c1.unknown_names() {
            let a = value(&c1, &y1, &name);
            let b = value(&c2, &y2, &name);
            assert!((b - 2.0 * a).abs() < 1e-7, "{name}: {b} vs 2*{a}");
        }
    }

    #[test]
    fn test_singular_circuit_reports_linear_solve_failure() {
        // Two ideal voltage sources in parallel disagreeing: structurally
        // degenerate, the Jacobian is singular.
        let (circuit, _) = parse(
            "V1 a 0 1\n\
             V2 a 0 2\n\
             R1 a 0 1k\n\
             .OP\n.END\n",
        );
        let mut solver = DcSolver::new(&circuit).unwrap();
        let err = solver
            .solve(&circuit, circuit.initial_guess(), "operating point")
            .unwrap_err();
        assert!(matches!(err, SimError::LinearSolveFailed));
    }

    #[test]
    fn test_dc_sweep_grid_and_continuation() {
        let (mut circuit, analysis) = parse(
            "V1 a 0 0\n\
             R1 a 0 1k\n\
             .DC V1 0 1 0.25\n\
             .END\n",
        );
        let mut points = Vec::new();
        run_dc_sweep(&mut circuit, &analysis, |v, y| points.push((v, y[0]))).unwrap();
        assert_eq!(points.len(), 5);
        assert_eq!(points[0].0, 0.0);
        assert_eq!(points[4].0, 1.0);
        for (v, va) in points {
            assert!((va - v).abs() < 1e-8);
        }
    }
}
