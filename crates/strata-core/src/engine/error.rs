use thiserror::Error;

use super::config::ConfigError;
use super::executor::ProgramError;
use super::handoff::CellClosed;
use super::optimizer::ipi::ProtocolError;
use crate::core::models::ids::CalcId;
use crate::core::models::system::ModelError;
use crate::core::oniom::CollectError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Model error: {source}")]
    Model {
        #[from]
        source: ModelError,
    },

    #[error("Result collection failed: {source}")]
    Collect {
        #[from]
        source: CollectError,
    },

    #[error("External program failed for calculation {calc_id}: {source}")]
    ExternalProgram {
        calc_id: CalcId,
        #[source]
        source: ProgramError,
    },

    #[error("Optimiser protocol violation at slice {depth}: {reason}")]
    ProtocolViolation { depth: usize, reason: String },

    #[error("Slice {depth} is out of range; the layer tree has {slices} slice(s)")]
    SliceOutOfRange { depth: usize, slices: usize },

    #[error("Optimiser socket error: {source}")]
    Socket {
        #[from]
        source: ProtocolError,
    },

    #[error("Optimiser channel closed: {0}")]
    ChannelClosed(#[from] CellClosed),

    #[error("I/O error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
