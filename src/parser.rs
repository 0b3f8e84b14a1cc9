use std::collections::{HashMap, HashSet};
use std::fs;

use lazy_static::lazy_static;
use nom::number::complete::double;
use regex::Regex;

use crate::circuit::{is_ground_name, Circuit};
use crate::element::{ControlNodes, Element, ElementKind, SensorRef, Waveform};
use crate::error::{Result, SimError};

/// Analysis registered by a netlist directive. The last directive wins;
/// `.OP` is the default when none is given.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Operating,
    DcSweep {
        source: String,
        start: f64,
        stop: f64,
        increment: f64,
    },
    Transient(TransientSpec),
}

/// `.TRAN <step> <stop> [<start>] [<maxStep>] [UIC]`
#[derive(Debug, Clone, PartialEq)]
pub struct TransientSpec {
    pub output_step: f64,
    pub stop_time: f64,
    pub start_time: f64,
    /// Cap on the integrator's internal step; defaults to stop/1000.
    pub max_step: f64,
    /// Skip the consistent-IC projection and trust the zero initial state.
    pub uic: bool,
}

/// Output of a successful parse: the sized circuit plus the requested run.
#[derive(Debug, Clone)]
pub struct ParsedNetlist {
    pub circuit: Circuit,
    pub analysis: Analysis,
}

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Line-oriented SPICE-subset netlist parser.
pub struct SpiceParser;

impl Default for SpiceParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiceParser {
    pub fn new() -> Self {
        SpiceParser
    }

    pub fn parse_file(&self, path: &str) -> Result<ParsedNetlist> {
        let content = fs::read_to_string(path).map_err(|e| SimError::Io {
            path: path.to_string(),
            source: e,
        })?;
        self.parse_netlist(&content)
    }

    pub fn parse_netlist(&self, content: &str) -> Result<ParsedNetlist> {
        let mut builder = NetlistBuilder::default();

        for (i, raw) in content.lines().enumerate() {
            let line_no = i + 1;
            let Some(line) = normalize_line(raw) else {
                continue;
            };
            if builder.parse_line(line_no, &line)? {
                break; // .END
            }
        }

        builder.finish()
    }
}

/// Trim, strip `*` comment lines and `;`/`//` inline comments, collapse
/// interior whitespace. Returns None for lines with no content left.
fn normalize_line(raw: &str) -> Option<String> {
    let mut line = raw.trim();
    if line.is_empty() || line.starts_with('*') {
        return None;
    }
    let cut = [line.find(';'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    line = line[..cut].trim();
    if line.is_empty() {
        return None;
    }
    Some(WHITESPACE.replace_all(line, " ").into_owned())
}

/// Numeric token: leading signed decimal (exponent notation accepted)
/// followed by an optional SPICE scale suffix.
pub fn parse_value(token: &str, line: usize) -> Result<f64> {
    let bad = |msg: String| SimError::ParseError { line, message: msg };

    let (rest, number) = double::<&str, nom::error::Error<&str>>(token)
        .map_err(|_| bad(format!("malformed numeric value '{token}'")))?;

    let scale = match rest.to_ascii_uppercase().as_str() {
        "" => 1.0,
        "T" => 1e12,
        "G" => 1e9,
        "MEG" => 1e6,
        "K" => 1e3,
        "M" => 1e-3,
        "U" => 1e-6,
        "N" => 1e-9,
        "P" => 1e-12,
        "F" => 1e-15,
        other => {
            return Err(bad(format!(
                "unknown suffix '{other}' in numeric value '{token}'"
            )))
        }
    };
    Ok(number * scale)
}

#[derive(Default)]
struct NetlistBuilder {
    elements: Vec<Element>,
    analysis: Option<Analysis>,
    /// Line the `.DC` directive appeared on, for error reporting.
    sweep_line: usize,
}

impl NetlistBuilder {
    /// Parse one normalized statement. Returns true on `.END`.
    fn parse_line(&mut self, line_no: usize, line: &str) -> Result<bool> {
        let tokens: Vec<&str> = line.split(' ').collect();
        let first = tokens[0];
        let c = first.chars().next().unwrap();

        if c == '.' {
            return self.parse_directive(line_no, &tokens);
        }
        if c.is_ascii_alphabetic() {
            self.parse_element(line_no, &tokens)?;
            return Ok(false);
        }
        Err(SimError::ParseError {
            line: line_no,
            message: format!("unrecognized statement '{line}'"),
        })
    }

    fn parse_directive(&mut self, line_no: usize, tokens: &[&str]) -> Result<bool> {
        match tokens[0].to_ascii_uppercase().as_str() {
            ".TRAN" => {
                require(tokens, 3, line_no, ".TRAN needs <step> <stop>")?;
                let output_step = parse_value(tokens[1], line_no)?;
                let stop_time = parse_value(tokens[2], line_no)?;

                // Optional positionals fill start then maxStep; UIC may
                // appear anywhere after them.
                let mut optional = Vec::new();
                let mut uic = false;
                for tok in &tokens[3..] {
                    if tok.eq_ignore_ascii_case("uic") {
                        uic = true;
                    } else {
                        optional.push(parse_value(tok, line_no)?);
                    }
                }
                let start_time = optional.first().copied().unwrap_or(0.0);
                let max_step = optional.get(1).copied().unwrap_or(stop_time / 1000.0);

                if output_step <= 0.0 || stop_time <= start_time || start_time < 0.0 {
                    return Err(SimError::ParseError {
                        line: line_no,
                        message: ".TRAN needs step > 0 and stop > start >= 0".into(),
                    });
                }
                self.analysis = Some(Analysis::Transient(TransientSpec {
                    output_step,
                    stop_time,
                    start_time,
                    max_step,
                    uic,
                }));
                log::debug!("registered transient analysis (line {line_no})");
            }
            ".DC" => {
                require(tokens, 5, line_no, ".DC needs <source> <start> <stop> <increment>")?;
                let start = parse_value(tokens[2], line_no)?;
                let stop = parse_value(tokens[3], line_no)?;
                let increment = parse_value(tokens[4], line_no)?;
                if increment == 0.0 || (stop - start) * increment < 0.0 {
                    return Err(SimError::ParseError {
                        line: line_no,
                        message: ".DC increment must step from start towards stop".into(),
                    });
                }
                self.analysis = Some(Analysis::DcSweep {
                    source: tokens[1].to_string(),
                    start,
                    stop,
                    increment,
                });
                self.sweep_line = line_no;
                log::debug!("registered DC sweep of {} (line {line_no})", tokens[1]);
            }
            ".OP" => {
                self.analysis = Some(Analysis::Operating);
                log::debug!("registered operating-point analysis (line {line_no})");
            }
            ".END" => return Ok(true),
            other => {
                return Err(SimError::ParseError {
                    line: line_no,
                    message: format!("unknown directive '{other}'"),
                })
            }
        }
        Ok(false)
    }

    fn parse_element(&mut self, line_no: usize, tokens: &[&str]) -> Result<()> {
        let letter = tokens[0].chars().next().unwrap().to_ascii_uppercase();
        let element = match letter {
            'R' => parse_two_terminal(tokens, line_no, "resistor", |v| {
                ElementKind::Resistor { resistance: v }
            })?,
            'C' => parse_two_terminal(tokens, line_no, "capacitor", |v| {
                ElementKind::Capacitor { capacitance: v }
            })?,
            'L' => parse_two_terminal(tokens, line_no, "inductor", |v| {
                ElementKind::Inductor {
                    inductance: v,
                    branch: 0,
                }
            })?,
            'D' => {
                require(tokens, 4, line_no, "diode needs <name> <anode> <cathode> <Vfwd>")?;
                let forward_voltage = parse_value(tokens[3], line_no)?;
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    ElementKind::Diode {
                        forward_voltage,
                        saturation_current: 1e-14,
                        ideality: 1.0,
                        thermal_voltage: 0.02585,
                    },
                )
            }
            'V' => {
                let waveform = parse_source_waveform(tokens, line_no)?;
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    ElementKind::VoltageSource { waveform, branch: 0 },
                )
            }
            'I' => {
                let waveform = parse_source_waveform(tokens, line_no)?;
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    ElementKind::CurrentSource { waveform },
                )
            }
            'E' | 'G' => {
                require(tokens, 6, line_no, "controlled source needs <name> <out+> <out-> <c+> <c-> <gain>")?;
                let control = ControlNodes {
                    names: [tokens[3].to_string(), tokens[4].to_string()],
                    indices: [0, 0],
                };
                let gain = parse_value(tokens[5], line_no)?;
                let kind = if letter == 'E' {
                    ElementKind::Vcvs {
                        control,
                        gain,
                        branch: 0,
                    }
                } else {
                    ElementKind::Vccs { control, gain }
                };
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    kind,
                )
            }
            'H' | 'F' => {
                require(tokens, 5, line_no, "controlled source needs <name> <out+> <out-> <Vsensor> <gain>")?;
                let sensor = SensorRef {
                    name: tokens[3].to_string(),
                    branch: 0,
                };
                let gain = parse_value(tokens[4], line_no)?;
                let kind = if letter == 'H' {
                    ElementKind::Ccvs {
                        sensor,
                        gain,
                        branch: 0,
                    }
                } else {
                    ElementKind::Cccs { sensor, gain }
                };
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    kind,
                )
            }
            'Z' | 'X' => {
                require(
                    tokens,
                    10,
                    line_no,
                    "pulse source needs <name> <n1> <n2> <Vinit> <Vpulse> <delay> <rise> <fall> <width> <period>",
                )?;
                let p: Vec<f64> = tokens[3..10]
                    .iter()
                    .map(|t| parse_value(t, line_no))
                    .collect::<Result<_>>()?;
                let waveform = Waveform::pulse(p[0], p[1], p[2], p[3], p[4], p[5], p[6]);
                let kind = if letter == 'Z' {
                    ElementKind::VoltageSource { waveform, branch: 0 }
                } else {
                    ElementKind::CurrentSource { waveform }
                };
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    kind,
                )
            }
            'A' | 'B' => {
                require(tokens, 3, line_no, "delta source needs <name> <n1> <n2>")?;
                // Dirac delta approximated by a unit-area triangle over 2 ns:
                // 1 ns rise to 1e9, 1 ns fall, fired once at t = 0.
                let waveform = Waveform::pulse(0.0, 1e9, 0.0, 1e-9, 1e-9, 0.0, 1.0);
                let kind = if letter == 'A' {
                    ElementKind::VoltageSource { waveform, branch: 0 }
                } else {
                    ElementKind::CurrentSource { waveform }
                };
                Element::new(
                    tokens[0].to_string(),
                    tokens[1].to_string(),
                    tokens[2].to_string(),
                    kind,
                )
            }
            other => {
                return Err(SimError::ParseError {
                    line: line_no,
                    message: format!("unknown element type '{other}' ({})", tokens[0]),
                })
            }
        };

        log::debug!("parsed {} (line {line_no})", element.name);
        self.elements.push(element);
        Ok(())
    }

    /// Sizing and indexing pass, then sweep-target validation.
    fn finish(self) -> Result<ParsedNetlist> {
        let circuit = size_and_index(self.elements)?;
        circuit.log_summary();

        let analysis = self.analysis.unwrap_or(Analysis::Operating);
        if let Analysis::DcSweep { ref source, .. } = analysis {
            let idx = circuit.find_element(source).ok_or_else(|| SimError::ParseError {
                line: self.sweep_line,
                message: format!("sweep source '{source}' not found in circuit"),
            })?;
            let sweepable = matches!(
                circuit.elements[idx].kind,
                ElementKind::VoltageSource {
                    waveform: Waveform::Dc { .. },
                    ..
                } | ElementKind::CurrentSource {
                    waveform: Waveform::Dc { .. },
                }
            );
            if !sweepable {
                return Err(SimError::ParseError {
                    line: self.sweep_line,
                    message: format!("sweep source '{source}' is not a DC voltage or current source"),
                });
            }
        }

        Ok(ParsedNetlist { circuit, analysis })
    }
}

fn require(tokens: &[&str], n: usize, line: usize, what: &str) -> Result<()> {
    if tokens.len() < n {
        return Err(SimError::ParseError {
            line,
            message: format!("insufficient tokens for '{}': {what}", tokens[0]),
        });
    }
    Ok(())
}

/// R/C/L lines: `<name> <n1> <n2> <value>` with a positivity check.
fn parse_two_terminal(
    tokens: &[&str],
    line: usize,
    what: &str,
    make: impl FnOnce(f64) -> ElementKind,
) -> Result<Element> {
    require(tokens, 4, line, "expected <name> <n1> <n2> <value>")?;
    let value = parse_value(tokens[3], line)?;
    if value <= 0.0 {
        return Err(SimError::ParseError {
            line,
            message: format!("{what} '{}' must have a positive value", tokens[0]),
        });
    }
    Ok(Element::new(
        tokens[0].to_string(),
        tokens[1].to_string(),
        tokens[2].to_string(),
        make(value),
    ))
}

/// Value field of a V/I source line: `SIN(...)`/`SINE(...)`, `PULSE ...`,
/// `DC <value>`, or a bare numeric value.
fn parse_source_waveform(tokens: &[&str], line: usize) -> Result<Waveform> {
    require(tokens, 4, line, "source needs <name> <n+> <n-> <value|DC v|SIN(...)|PULSE ...>")?;
    let name = tokens[0];
    let joined = tokens[3..].join(" ");
    let upper = joined.to_ascii_uppercase();

    if upper.starts_with("SIN(") || upper.starts_with("SINE(") || upper.starts_with("SIN (") || upper.starts_with("SINE (") {
        let open = joined.find('(').unwrap();
        let close = joined.rfind(')').ok_or_else(|| SimError::ParseError {
            line,
            message: format!("SIN expression for '{name}' is not terminated with ')'"),
        })?;
        let params: Vec<f64> = joined[open + 1..close]
            .split_whitespace()
            .map(|t| parse_value(t, line))
            .collect::<Result<_>>()?;
        if params.len() < 3 {
            return Err(SimError::ParseError {
                line,
                message: format!("SIN source '{name}' needs at least offset, amplitude, frequency"),
            });
        }
        return Ok(Waveform::Sine {
            offset: params[0],
            amplitude: params[1],
            frequency: params[2],
            delay: params.get(3).copied().unwrap_or(0.0),
            damping: params.get(4).copied().unwrap_or(0.0),
            phase: params.get(5).copied().unwrap_or(0.0),
        });
    }

    if upper.starts_with("PULSE") {
        let body = joined[5..].replace(['(', ')'], " ");
        let params: Vec<f64> = body
            .split_whitespace()
            .map(|t| parse_value(t, line))
            .collect::<Result<_>>()?;
        if params.len() < 7 {
            return Err(SimError::ParseError {
                line,
                message: format!(
                    "PULSE source '{name}' needs <Vinit> <Vpulse> <delay> <rise> <fall> <width> <period>"
                ),
            });
        }
        return Ok(Waveform::pulse(
            params[0], params[1], params[2], params[3], params[4], params[5], params[6],
        ));
    }

    if tokens[3].eq_ignore_ascii_case("dc") {
        require(tokens, 5, line, "DC source needs a value after the DC keyword")?;
        return Ok(Waveform::Dc {
            value: parse_value(tokens[4], line)?,
        });
    }

    Ok(Waveform::Dc {
        value: parse_value(tokens[3], line)?,
    })
}

/// Assign node and branch indices, resolve cross-references, and check the
/// structural invariants: ground check, node indexing, terminal resolution,
/// branch assignment, then sensor and control-node resolution.
fn size_and_index(mut elements: Vec<Element>) -> Result<Circuit> {
    // Duplicate names are a hard failure.
    let mut seen = HashSet::new();
    for e in &elements {
        if !seen.insert(e.name.clone()) {
            return Err(SimError::DuplicateElementName(e.name.clone()));
        }
    }

    // At least one element terminal must touch ground.
    if !elements
        .iter()
        .any(|e| e.nodes.iter().any(|n| is_ground_name(n)))
    {
        return Err(SimError::NoGround);
    }

    // Node table in first-seen order; every ground spelling maps to 0.
    let mut node_map: HashMap<String, usize> = HashMap::new();
    let mut node_names = vec!["0".to_string()];
    for e in &elements {
        for name in e.referenced_nodes() {
            if is_ground_name(name) {
                node_map.entry(name.to_string()).or_insert(0);
            } else if !node_map.contains_key(name) {
                node_map.insert(name.to_string(), node_names.len());
                node_names.push(name.to_string());
            }
        }
    }
    let num_nodes = node_names.len() - 1;

    // Terminal and control-node resolution.
    for e in &mut elements {
        e.terminals = [node_map[&e.nodes[0]], node_map[&e.nodes[1]]];
        if let ElementKind::Vcvs { control, .. } | ElementKind::Vccs { control, .. } = &mut e.kind {
            control.indices = [node_map[&control.names[0]], node_map[&control.names[1]]];
        }
    }

    // Branch rows: the voltage-source block starts at K, the inductor block
    // at K + V; position within a block is insertion order among that kind.
    let num_voltage_branches = elements.iter().filter(|e| e.is_voltage_branch()).count();
    let num_inductors = elements.iter().filter(|e| e.is_inductor()).count();
    let mut next_voltage_row = num_nodes;
    let mut next_inductor_row = num_nodes + num_voltage_branches;
    for e in &mut elements {
        match &mut e.kind {
            ElementKind::VoltageSource { branch, .. }
            | ElementKind::Vcvs { branch, .. }
            | ElementKind::Ccvs { branch, .. } => {
                *branch = next_voltage_row;
                next_voltage_row += 1;
            }
            ElementKind::Inductor { branch, .. } => {
                *branch = next_inductor_row;
                next_inductor_row += 1;
            }
            _ => {}
        }
    }

    // Sensor resolution for current-controlled sources.
    let branch_by_name: HashMap<String, Option<usize>> = elements
        .iter()
        .map(|e| (e.name.clone(), e.is_voltage_branch().then(|| e.branch_row()).flatten()))
        .collect();
    for e in &mut elements {
        let element_name = e.name.clone();
        if let ElementKind::Ccvs { sensor, .. } | ElementKind::Cccs { sensor, .. } = &mut e.kind {
            match branch_by_name.get(&sensor.name) {
                None => {
                    return Err(SimError::SensorNotFound {
                        element: element_name,
                        sensor: sensor.name.clone(),
                    })
                }
                Some(None) => {
                    return Err(SimError::SensorNotVoltageSource {
                        element: element_name,
                        sensor: sensor.name.clone(),
                    })
                }
                Some(Some(row)) => sensor.branch = *row,
            }
        }
    }

    Ok(Circuit {
        elements,
        node_names,
        node_map,
        num_nodes,
        num_voltage_branches,
        num_inductors,
    })
}
