use thiserror::Error;

/// Error kinds for the whole simulator. All of these are fatal to the
/// current run; nothing is retried above the integrator's own step control.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("netlist has no ground node: connect at least one element terminal to '0' or 'GND'")]
    NoGround,

    #[error("{element}: sensor voltage source '{sensor}' not found")]
    SensorNotFound { element: String, sensor: String },

    #[error("{element}: sensor element '{sensor}' is not a voltage source")]
    SensorNotVoltageSource { element: String, sensor: String },

    #[error("duplicate element name '{0}'")]
    DuplicateElementName(String),

    #[error("Newton solver did not converge after {iterations} iterations at {context} (residual norm {residual:.3e})")]
    DidNotConverge {
        iterations: usize,
        residual: f64,
        /// What was being solved: "operating point", "sweep point V1 = 0.35", ...
        context: String,
    },

    #[error("linear solve failed: MNA matrix is singular (floating node or short across a voltage source?)")]
    LinearSolveFailed,

    #[error("consistent initial conditions could not be computed at t0 (residual norm {residual:.3e})")]
    IcFailed { residual: f64 },

    #[error("transient integrator failed at t = {time:.6e}: {message}")]
    IntegratorFailed { time: f64, message: String },

    #[error("failed to read netlist '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;
