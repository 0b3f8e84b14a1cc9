use nalgebra::{DMatrix, DVector};

use crate::circuit::Circuit;
use crate::error::{Result, SimError};

/// Perturbation used by the one-sided finite-difference Jacobians.
pub const FD_DELTA: f64 = 1e-8;

/// MNA residual workspace: the residual/Jacobian buffers sized once from the
/// circuit and reused for every assembly.
///
/// The DAE system is F(t, y, y') = 0; the DC system is F(y) = 0 with
/// capacitors and inductors replaced by their static equivalents. Both are
/// assembled by summing element stamps into a zeroed residual vector.
#[derive(Debug, Clone)]
pub struct MnaSystem {
    size: usize,
    f: DVector<f64>,
    f_pert: DVector<f64>,
    jacobian: DMatrix<f64>,
}

impl MnaSystem {
    pub fn new(circuit: &Circuit) -> Result<Self> {
        let size = circuit.num_equations();
        if size == 0 {
            return Err(SimError::ParseError {
                line: 0,
                message: "circuit has no unknowns to solve for".into(),
            });
        }
        Ok(MnaSystem {
            size,
            f: DVector::zeros(size),
            f_pert: DVector::zeros(size),
            jacobian: DMatrix::zeros(size, size),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Assemble the DC residual F(y) into `f`.
    pub fn assemble_dc(circuit: &Circuit, y: &DVector<f64>, f: &mut DVector<f64>) {
        f.fill(0.0);
        for e in &circuit.elements {
            e.dc_stamp(y, f);
        }
    }

    /// Assemble the DAE residual F(t, y, y') into `f`.
    pub fn assemble_residual(
        circuit: &Circuit,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        f: &mut DVector<f64>,
    ) {
        f.fill(0.0);
        for e in &circuit.elements {
            e.residual_stamp(t, y, yp, f);
        }
    }

    /// DC residual into the internal buffer; returns its L2 norm.
    pub fn dc_residual(&mut self, circuit: &Circuit, y: &DVector<f64>) -> f64 {
        Self::assemble_dc(circuit, y, &mut self.f);
        self.f.norm()
    }

    pub fn residual(&self) -> &DVector<f64> {
        &self.f
    }

    /// One-sided finite-difference Jacobian of the DC residual about y,
    /// reusing the residual already assembled in the internal buffer:
    /// column j = (F(y + delta e_j) - F(y)) / delta.
    pub fn dc_jacobian(&mut self, circuit: &Circuit, y: &mut DVector<f64>) -> &DMatrix<f64> {
        for j in 0..self.size {
            let orig = y[j];
            y[j] = orig + FD_DELTA;
            Self::assemble_dc(circuit, y, &mut self.f_pert);
            for i in 0..self.size {
                self.jacobian[(i, j)] = (self.f_pert[i] - self.f[i]) / FD_DELTA;
            }
            y[j] = orig;
        }
        &self.jacobian
    }
}

/// One-sided finite-difference Jacobian of an arbitrary residual closure.
/// `f_base` must hold eval(u); scratch and jac are caller-owned so the
/// transient solver can keep its buffers across steps.
pub fn fd_jacobian<F>(
    u: &mut DVector<f64>,
    f_base: &DVector<f64>,
    scratch: &mut DVector<f64>,
    jac: &mut DMatrix<f64>,
    mut eval: F,
) where
    F: FnMut(&DVector<f64>, &mut DVector<f64>),
{
    let n = u.len();
    for j in 0..n {
        let orig = u[j];
        u[j] = orig + FD_DELTA;
        eval(u, scratch);
        for i in 0..n {
            jac[(i, j)] = (scratch[i] - f_base[i]) / FD_DELTA;
        }
        u[j] = orig;
    }
}

/// Weighted RMS norm used by the transient error and convergence tests:
/// sqrt(mean((v_i / (atol + rtol*|ref_i|))^2)).
pub fn wrms_norm(v: &DVector<f64>, reference: &DVector<f64>, rtol: f64, atol: f64) -> f64 {
    let n = v.len();
    let mut acc = 0.0;
    for i in 0..n {
        let w = atol + rtol * reference[i].abs();
        let e = v[i] / w;
        acc += e * e;
    }
    (acc / n as f64).sqrt()
}

/// WRMS norm restricted to the components where `mask` is true. Used by the
/// local error test, which excludes algebraic variables: they may jump
/// instantaneously (source edges, UIC starts) without being wrong. Returns 0
/// when the mask selects nothing.
pub fn wrms_norm_masked(
    v: &DVector<f64>,
    reference: &DVector<f64>,
    mask: &[bool],
    rtol: f64,
    atol: f64,
) -> f64 {
    let mut acc = 0.0;
    let mut count = 0usize;
    for i in 0..v.len() {
        if mask[i] {
            let w = atol + rtol * reference[i].abs();
            let e = v[i] / w;
            acc += e * e;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        (acc / count as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SpiceParser;

    fn divider() -> Circuit {
        SpiceParser::new()
            .parse_netlist(
                "V1 in 0 10\n\
                 R1 in out 1k\n\
                 R2 out 0 1k\n\
                 .OP\n.END\n",
            )
            .unwrap()
            .circuit
    }

    #[test]
    fn test_dc_residual_vanishes_at_solution() {
        let circuit = divider();
        // y = [V(in), V(out), I(V1)] at the exact solution.
        let y = DVector::from_vec(vec![10.0, 5.0, -5e-3]);
        let mut sys = MnaSystem::new(&circuit).unwrap();
        let norm = sys.dc_residual(&circuit, &y);
        assert!(norm < 1e-12, "residual norm {norm}");
    }

    #[test]
    fn test_dc_jacobian_matches_linear_system() {
        let circuit = divider();
        let mut y = DVector::zeros(3);
        let mut sys = MnaSystem::new(&circuit).unwrap();
        sys.dc_residual(&circuit, &y);
        let jac = sys.dc_jacobian(&circuit, &mut y).clone();

        // KCL at in: (Vin-Vout)/R1 + Iv
        assert!((jac[(0, 0)] - 1e-3).abs() < 1e-9);
        assert!((jac[(0, 1)] + 1e-3).abs() < 1e-9);
        assert!((jac[(0, 2)] - 1.0).abs() < 1e-6);
        // Branch row: Vin - 10
        assert!((jac[(2, 0)] - 1.0).abs() < 1e-6);
        assert!(jac[(2, 1)].abs() < 1e-9);
    }

    #[test]
    fn test_stamp_order_invariance() {
        let circuit = divider();
        let mut shuffled = circuit.clone();
        shuffled.elements.reverse();

        let y = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut f1 = DVector::zeros(3);
        let mut f2 = DVector::zeros(3);
        MnaSystem::assemble_dc(&circuit, &y, &mut f1);
        MnaSystem::assemble_dc(&shuffled, &y, &mut f2);
        for i in 0..3 {
            assert!((f1[i] - f2[i]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_wrms_norm() {
        let v = DVector::from_vec(vec![1e-6, 1e-6]);
        let r = DVector::from_vec(vec![0.0, 0.0]);
        // Each component weighs in at exactly 1 with atol = 1e-6.
        assert!((wrms_norm(&v, &r, 1e-4, 1e-6) - 1.0).abs() < 1e-12);
    }
}
