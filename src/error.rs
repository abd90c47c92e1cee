use thiserror::Error;

use crate::case::BusType;

#[derive(Debug, Error)]
pub enum PowerFlowError {
    #[error("network has no buses")]
    EmptyNetwork,

    #[error("expected exactly one slack bus, found {0}")]
    SlackCount(usize),

    #[error("bus {0} is referenced but not defined")]
    UnknownBus(usize),

    #[error("bus {0} is defined more than once")]
    DuplicateBus(usize),

    #[error("invalid bus type code {0} (expected 1 = slack, 2 = PV, 3 = PQ)")]
    InvalidTypeCode(i64),

    #[error("bus {bus_id} cannot change type from {from} to {to}")]
    InvalidTransition {
        bus_id: usize,
        from: BusType,
        to: BusType,
    },

    #[error("{table} table, line {line}: {message}")]
    Parse {
        table: &'static str,
        line: usize,
        message: String,
    },

    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PowerFlowError>;
