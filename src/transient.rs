use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::circuit::Circuit;
use crate::error::{Result, SimError};
use crate::mna::{fd_jacobian, wrms_norm, wrms_norm_masked, MnaSystem};
use crate::parser::TransientSpec;
use crate::solver::solve_dense;

/// Tuning knobs of the DAE integrator. The tolerances are uniform across all
/// solution components.
#[derive(Debug, Clone)]
pub struct TransientConfig {
    pub rtol: f64,
    pub atol: f64,
    pub max_order: usize,
    pub max_newton_iterations: usize,
    /// Consecutive step failures tolerated before giving up.
    pub max_step_failures: usize,
    /// Hard cap on accepted internal steps.
    pub max_steps: usize,
}

impl Default for TransientConfig {
    fn default() -> Self {
        TransientConfig {
            rtol: 1e-4,
            atol: 1e-6,
            max_order: 5,
            max_newton_iterations: 8,
            max_step_failures: 25,
            max_steps: 10_000_000,
        }
    }
}

/// Derivative weights of the interpolating polynomial through `xs`,
/// evaluated at xs[0]: p'(xs[0]) = sum w[i] * f(xs[i]).
///
/// With xs = [t_new, t_{n-1}, ..., t_{n-q}] these are the variable-step
/// BDF-q coefficients.
fn lagrange_derivative_weights(xs: &[f64]) -> Vec<f64> {
    let m = xs.len();
    let x0 = xs[0];
    let mut w = vec![0.0; m];
    for i in 1..m {
        let mut num = 1.0;
        for k in 0..m {
            if k != i && k != 0 {
                num *= x0 - xs[k];
            }
        }
        let mut den = 1.0;
        for k in 0..m {
            if k != i {
                den *= xs[i] - xs[k];
            }
        }
        w[i] = num / den;
    }
    w[0] = (1..m).map(|k| 1.0 / (x0 - xs[k])).sum();
    w
}

/// Value weights of the interpolating polynomial through `xs` at `x`.
fn lagrange_value_weights(xs: &[f64], x: f64) -> Vec<f64> {
    let m = xs.len();
    let mut w = vec![1.0; m];
    for i in 0..m {
        for k in 0..m {
            if k != i {
                w[i] *= (x - xs[k]) / (xs[i] - xs[k]);
            }
        }
    }
    w
}

/// Implicit variable-order BDF(1..5) integrator for the circuit DAE
/// F(t, y, y') = 0 with adaptive internal stepping and dense output.
///
/// The integrator owns every buffer it needs; the residual callback borrows
/// the circuit immutably and writes only into the preallocated F vector.
pub struct TransientSolver<'c> {
    circuit: &'c Circuit,
    spec: TransientSpec,
    config: TransientConfig,
    n: usize,
    diff: Vec<bool>,

    /// Accepted (t, y) pairs, newest last; at most max_order + 2 retained.
    history: Vec<(f64, DVector<f64>)>,
    order: usize,
    steps_at_order: usize,

    // Scratch buffers reused across every Newton iteration.
    g: DVector<f64>,
    g_pert: DVector<f64>,
    jac: DMatrix<f64>,
    yp: DVector<f64>,
}

impl<'c> TransientSolver<'c> {
    pub fn new(circuit: &'c Circuit, spec: TransientSpec) -> Result<Self> {
        let n = MnaSystem::new(circuit)?.size();
        Ok(TransientSolver {
            circuit,
            spec,
            config: TransientConfig::default(),
            n,
            diff: circuit.differential_ids(),
            history: Vec::new(),
            order: 1,
            steps_at_order: 0,
            g: DVector::zeros(n),
            g_pert: DVector::zeros(n),
            jac: DMatrix::zeros(n, n),
            yp: DVector::zeros(n),
        })
    }

    /// Run the simulation, invoking `on_sample` at t_start, every outputStep
    /// after it, and at exactly t_stop.
    pub fn run(&mut self, mut on_sample: impl FnMut(f64, &DVector<f64>)) -> Result<()> {
        let t0 = self.spec.start_time;
        let t_stop = self.spec.stop_time;
        let span = t_stop - t0;

        let mut y0 = if self.spec.uic {
            DVector::zeros(self.n)
        } else {
            self.circuit.initial_guess()
        };
        let mut yp0 = DVector::zeros(self.n);

        if !self.spec.uic {
            self.consistent_initial_conditions(t0, &mut y0, &mut yp0)?;
            debug!("[tran] consistent initial conditions computed");
        }

        // User sample grid; the last sample is pinned to exactly t_stop.
        let out_step = self.spec.output_step;
        let sample_count = ((span / out_step) - 1e-9).ceil().max(1.0) as usize;
        let sample_time = move |k: usize| -> f64 {
            if k >= sample_count {
                t_stop
            } else {
                t0 + k as f64 * out_step
            }
        };

        on_sample(t0, &y0);
        let mut next_sample = 1usize;

        self.history.clear();
        self.history.push((t0, y0));
        self.order = 1;
        self.steps_at_order = 0;

        let h_max = if self.spec.max_step > 0.0 {
            self.spec.max_step
        } else {
            span / 1000.0
        };
        let h_floor = (span * 1e-15).max(1e-30);
        let mut h = (self.spec.output_step.min(h_max) / 100.0).min(span / 2.0);

        let mut t = t0;
        let mut failures = 0usize;
        let mut accepted_steps = 0usize;

        while t < t_stop {
            if accepted_steps > self.config.max_steps {
                return Err(SimError::IntegratorFailed {
                    time: t,
                    message: format!("exceeded {} internal steps", self.config.max_steps),
                });
            }

            h = h.min(h_max).max(h_floor);
            if t + h > t_stop {
                h = t_stop - t;
            }
            // Land exactly on the next source discontinuity.
            let mut at_breakpoint = false;
            if let Some(tb) = self.circuit.next_breakpoint(t) {
                if t + h >= tb {
                    h = tb - t;
                    at_breakpoint = true;
                }
            }

            let t_new = t + h;
            match self.try_step(t_new) {
                Ok((y_new, err)) => {
                    if err <= 1.0 || h <= h_floor * 2.0 {
                        // Accept.
                        t = t_new;
                        self.history.push((t, y_new));
                        if self.history.len() > self.config.max_order + 2 {
                            self.history.remove(0);
                        }
                        accepted_steps += 1;
                        failures = 0;
                        self.steps_at_order += 1;
                        trace!("[tran] t = {t:.6e} accepted (h = {h:.3e}, order {})", self.order);

                        // Dense output for every pending sample in (t_prev, t].
                        while next_sample <= sample_count && sample_time(next_sample) <= t + h_floor {
                            let ts = sample_time(next_sample);
                            let ys = self.interpolate(ts);
                            on_sample(ts, &ys);
                            next_sample += 1;
                        }

                        if at_breakpoint {
                            // Discard pre-edge history: the interpolant must
                            // not bridge the kink.
                            let last = self.history.pop().unwrap();
                            self.history.clear();
                            self.history.push(last);
                            self.order = 1;
                            self.steps_at_order = 0;
                            h = h.max(h_max / 1000.0);
                        } else {
                            let q = self.order;
                            if self.steps_at_order > q + 1
                                && q < self.config.max_order
                                && self.history.len() > q + 1
                            {
                                self.order = q + 1;
                                self.steps_at_order = 0;
                            }
                            let factor = if err > 0.0 {
                                (0.9 * err.powf(-1.0 / (q as f64 + 1.0))).clamp(0.2, 2.5)
                            } else {
                                2.5
                            };
                            h *= factor;
                        }
                    } else {
                        // Error test failed: shrink and drop the order.
                        failures += 1;
                        if failures > self.config.max_step_failures {
                            return Err(SimError::IntegratorFailed {
                                time: t,
                                message: format!("local error test kept failing (err = {err:.3e})"),
                            });
                        }
                        let q = self.order as f64;
                        h *= (0.9 * err.powf(-1.0 / (q + 1.0))).clamp(0.1, 0.5);
                        self.order = (self.order - 1).max(1);
                        self.steps_at_order = 0;
                        trace!("[tran] t = {t:.6e} rejected (err = {err:.3e})");
                    }
                }
                Err(StepError::Fatal(e)) => return Err(e),
                Err(StepError::NewtonFailed) => {
                    failures += 1;
                    if failures > self.config.max_step_failures || h <= h_floor * 2.0 {
                        return Err(SimError::IntegratorFailed {
                            time: t,
                            message: "Newton iteration kept failing while shrinking the step".into(),
                        });
                    }
                    h *= 0.5;
                    self.order = (self.order - 1).max(1);
                    self.steps_at_order = 0;
                    trace!("[tran] t = {t:.6e} Newton failure, halving h to {h:.3e}");
                }
            }
        }

        // Float slack can leave the final samples pending.
        while next_sample <= sample_count {
            let ts = sample_time(next_sample).min(t_stop);
            let ys = self.interpolate(ts);
            on_sample(ts, &ys);
            next_sample += 1;
        }

        debug!("[tran] finished: {accepted_steps} internal steps");
        Ok(())
    }

    /// One BDF step to t_new at the current order. Returns the corrected
    /// solution and the weighted local error estimate.
    fn try_step(&mut self, t_new: f64) -> std::result::Result<(DVector<f64>, f64), StepError> {
        let hist_len = self.history.len();
        let q = self.order.min(hist_len);

        // Interpolation nodes: the unknown point plus the q newest history
        // points, newest first.
        let mut xs = Vec::with_capacity(q + 1);
        xs.push(t_new);
        for j in 0..q {
            xs.push(self.history[hist_len - 1 - j].0);
        }
        let w = lagrange_derivative_weights(&xs);
        let c0 = w[0];

        // History part of the BDF derivative.
        let mut beta = DVector::zeros(self.n);
        for j in 0..q {
            beta.axpy(w[j + 1], &self.history[hist_len - 1 - j].1, 1.0);
        }

        // Predictor: extrapolate the interpolant through the newest
        // min(q+1, hist) points. With one history point this is constant.
        let p = (q + 1).min(hist_len);
        let xs_pred: Vec<f64> = (0..p).map(|j| self.history[hist_len - 1 - j].0).collect();
        let wp = lagrange_value_weights(&xs_pred, t_new);
        let mut y = DVector::zeros(self.n);
        for j in 0..p {
            y.axpy(wp[j], &self.history[hist_len - 1 - j].1, 1.0);
        }
        let y_pred = y.clone();

        // Newton on G(y) = F(t_new, y, c0*y + beta).
        let circuit = self.circuit;
        let mut converged = false;
        for _ in 0..self.config.max_newton_iterations {
            self.yp.copy_from(&beta);
            self.yp.axpy(c0, &y, 1.0);
            MnaSystem::assemble_residual(circuit, t_new, &y, &self.yp, &mut self.g);
            if self.g.amax() < 1e-12 {
                converged = true;
                break;
            }

            let rhs = &self.g * -1.0;
            let (g, g_pert, jac, yp) = (&self.g, &mut self.g_pert, &mut self.jac, &mut self.yp);
            fd_jacobian(&mut y, g, g_pert, jac, |u, out| {
                yp.copy_from(&beta);
                yp.axpy(c0, u, 1.0);
                MnaSystem::assemble_residual(circuit, t_new, u, yp, out);
            });

            let delta = solve_dense(&self.jac, &rhs).map_err(|e| match e {
                SimError::LinearSolveFailed => StepError::NewtonFailed,
                other => StepError::Fatal(other),
            })?;
            y += &delta;

            if wrms_norm(&delta, &y, self.config.rtol, self.config.atol) < 0.33 {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(StepError::NewtonFailed);
        }

        // Local error estimate from the predictor-corrector difference,
        // over the differential components only.
        let diff = &y - &y_pred;
        let err = wrms_norm_masked(&diff, &y, &self.diff, self.config.rtol, self.config.atol)
            / (q as f64 + 1.0);
        Ok((y, err))
    }

    /// Dense output: interpolate the history polynomial at ts.
    fn interpolate(&self, ts: f64) -> DVector<f64> {
        let hist_len = self.history.len();
        let p = (self.order + 1).min(hist_len);
        let xs: Vec<f64> = (0..p).map(|j| self.history[hist_len - 1 - j].0).collect();
        let w = lagrange_value_weights(&xs, ts);
        let mut y = DVector::zeros(self.n);
        for j in 0..p {
            y.axpy(w[j], &self.history[hist_len - 1 - j].1, 1.0);
        }
        y
    }

    /// Project the user's (y0, y'0) onto the constraint manifold
    /// F(t0, y, y') = 0: algebraic components of y and derivatives of
    /// differential components are free, differential y values are held
    /// (IDA's YA_YDP_INIT mode).
    fn consistent_initial_conditions(
        &mut self,
        t0: f64,
        y0: &mut DVector<f64>,
        yp0: &mut DVector<f64>,
    ) -> Result<()> {
        let n = self.n;
        let circuit = self.circuit;
        let diff = self.diff.clone();

        // Pack the free components into u.
        let mut u = DVector::zeros(n);
        for i in 0..n {
            u[i] = if diff[i] { yp0[i] } else { y0[i] };
        }

        let mut y_eff = y0.clone();
        let mut yp_eff = DVector::zeros(n);
        let apply = |u: &DVector<f64>, y_eff: &mut DVector<f64>, yp_eff: &mut DVector<f64>| {
            for i in 0..n {
                if diff[i] {
                    yp_eff[i] = u[i];
                } else {
                    y_eff[i] = u[i];
                    yp_eff[i] = 0.0;
                }
            }
        };

        let mut norm = f64::INFINITY;
        for iter in 0..50 {
            apply(&u, &mut y_eff, &mut yp_eff);
            MnaSystem::assemble_residual(circuit, t0, &y_eff, &yp_eff, &mut self.g);
            norm = self.g.norm();
            trace!("[ic] iter {iter} residual norm = {norm:.3e}");
            if norm < 1e-9 {
                y0.copy_from(&y_eff);
                yp0.copy_from(&yp_eff);
                return Ok(());
            }

            let rhs = &self.g * -1.0;
            let (g, g_pert, jac) = (&self.g, &mut self.g_pert, &mut self.jac);
            let (ye, ype) = (&mut y_eff, &mut yp_eff);
            fd_jacobian(&mut u, g, g_pert, jac, |uu, out| {
                apply(uu, ye, ype);
                MnaSystem::assemble_residual(circuit, t0, ye, ype, out);
            });
            let delta = solve_dense(&self.jac, &rhs)?;
            u += delta;
        }
        Err(SimError::IcFailed { residual: norm })
    }
}

enum StepError {
    NewtonFailed,
    Fatal(SimError),
}
