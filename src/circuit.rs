use std::collections::HashMap;

use nalgebra::DVector;

use crate::element::{Element, ElementKind, Waveform};

/// Returns true for the reserved ground spellings.
pub fn is_ground_name(name: &str) -> bool {
    name == "0" || name.eq_ignore_ascii_case("gnd")
}

/// Indexed circuit produced by the parser's sizing pass.
///
/// Elements live in a plain arena; every cross-reference (CCVS/CCCS sensor,
/// sweep source, control nodes) is an index into it or into the node table.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub elements: Vec<Element>,
    /// Node names by index; index 0 is ground.
    pub node_names: Vec<String>,
    pub node_map: HashMap<String, usize>,
    /// K: non-ground node count.
    pub num_nodes: usize,
    /// V: voltage-source-like branches (independent V of any waveform, VCVS, CCVS).
    pub num_voltage_branches: usize,
    /// L: inductor branches.
    pub num_inductors: usize,
}

impl Circuit {
    /// Total MNA dimension N = K + V + L.
    pub fn num_equations(&self) -> usize {
        self.num_nodes + self.num_voltage_branches + self.num_inductors
    }

    /// Ordered names of the unknowns: node voltages by node index, then
    /// voltage-branch currents by branch row, then inductor currents.
    pub fn unknown_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.num_equations());
        for k in 1..=self.num_nodes {
            names.push(format!("V({})", self.node_names[k]));
        }

        let mut branches: Vec<(usize, &str)> = self
            .elements
            .iter()
            .filter_map(|e| e.branch_row().map(|row| (row, e.name.as_str())))
            .collect();
        branches.sort_by_key(|(row, _)| *row);
        for (_, name) in branches {
            names.push(format!("I({})", name));
        }
        names
    }

    /// Cheap initial guess for the solvers: zero everywhere except nodes tied
    /// to ground through a DC voltage source, which start at +-V. Newton
    /// corrects the rest.
    pub fn initial_guess(&self) -> DVector<f64> {
        let mut y = DVector::zeros(self.num_equations());
        for e in &self.elements {
            if let ElementKind::VoltageSource {
                waveform: Waveform::Dc { value },
                ..
            } = e.kind
            {
                let [n1, n2] = e.terminals;
                if n1 != 0 && n2 == 0 {
                    y[n1 - 1] = value;
                } else if n1 == 0 && n2 != 0 {
                    y[n2 - 1] = -value;
                }
            }
        }
        y
    }

    /// Differential/algebraic classification of each unknown: true for
    /// inductor-current rows and for node rows touched by a capacitor.
    pub fn differential_ids(&self) -> Vec<bool> {
        let mut id = vec![false; self.num_equations()];
        for e in &self.elements {
            match e.kind {
                ElementKind::Inductor { branch, .. } => id[branch] = true,
                ElementKind::Capacitor { .. } => {
                    for n in e.terminals {
                        if n != 0 {
                            id[n - 1] = true;
                        }
                    }
                }
                _ => {}
            }
        }
        id
    }

    /// Index of the element with the given name.
    pub fn find_element(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    /// True if any element mentions a non-DC independent source.
    pub fn has_time_varying_sources(&self) -> bool {
        self.elements.iter().any(|e| {
            matches!(
                &e.kind,
                ElementKind::VoltageSource { waveform, .. } | ElementKind::CurrentSource { waveform }
                    if !matches!(waveform, Waveform::Dc { .. })
            )
        })
    }

    /// Set the output level of a swept DC source.
    ///
    /// The parser guarantees the sweep target is a DC voltage or current
    /// source, so other kinds are unreachable here.
    pub fn set_source_value(&mut self, index: usize, value: f64) {
        match &mut self.elements[index].kind {
            ElementKind::VoltageSource {
                waveform: Waveform::Dc { value: v },
                ..
            }
            | ElementKind::CurrentSource {
                waveform: Waveform::Dc { value: v },
            } => *v = value,
            _ => unreachable!("sweep target is validated at parse time"),
        }
    }

    /// Earliest source discontinuity strictly after t across all elements.
    pub fn next_breakpoint(&self, t: f64) -> Option<f64> {
        self.elements
            .iter()
            .filter_map(|e| e.next_breakpoint(t))
            .min_by(|a, b| a.partial_cmp(b).unwrap())
    }

    /// Log a one-paragraph summary of the sized circuit.
    pub fn log_summary(&self) {
        log::info!(
            "circuit sized: {} elements, {} non-ground nodes, {} voltage branches, {} inductors, N = {}",
            self.elements.len(),
            self.num_nodes,
            self.num_voltage_branches,
            self.num_inductors,
            self.num_equations()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SpiceParser;

    fn parse(netlist: &str) -> Circuit {
        SpiceParser::new().parse_netlist(netlist).unwrap().circuit
    }

    #[test]
    fn test_dimensioning() {
        let c = parse(
            "V1 in 0 10\n\
             R1 in out 1k\n\
             L1 out tail 1m\n\
             C1 tail 0 1u\n\
             .OP\n.END\n",
        );
        assert_eq!(c.num_nodes, 3);
        assert_eq!(c.num_voltage_branches, 1);
        assert_eq!(c.num_inductors, 1);
        assert_eq!(c.num_equations(), 5);
    }

    #[test]
    fn test_unknown_name_order() {
        let c = parse(
            "V1 a 0 1\n\
             L1 a b 1m\n\
             R1 b 0 10\n\
             V2 c 0 2\n\
             R2 c 0 10\n\
             .OP\n.END\n",
        );
        assert_eq!(
            c.unknown_names(),
            vec!["V(a)", "V(b)", "V(c)", "I(V1)", "I(V2)", "I(L1)"]
        );
    }

    #[test]
    fn test_initial_guess_from_grounded_sources() {
        let c = parse(
            "V1 a 0 5\n\
             V2 0 b 3\n\
             R1 a b 1k\n\
             .OP\n.END\n",
        );
        let y = c.initial_guess();
        let names = c.unknown_names();
        let ia = names.iter().position(|n| n == "V(a)").unwrap();
        let ib = names.iter().position(|n| n == "V(b)").unwrap();
        assert_eq!(y[ia], 5.0);
        assert_eq!(y[ib], -3.0);
    }

    #[test]
    fn test_differential_classification() {
        let c = parse(
            "V1 in 0 1\n\
             R1 in out 1k\n\
             C1 out 0 1u\n\
             L1 out tail 1m\n\
             R2 tail 0 10\n\
             .OP\n.END\n",
        );
        let id = c.differential_ids();
        let names = c.unknown_names();
        for (name, d) in names.iter().zip(&id) {
            match name.as_str() {
                "V(out)" | "I(L1)" => assert!(*d, "{name} should be differential"),
                _ => assert!(!*d, "{name} should be algebraic"),
            }
        }
    }
}
