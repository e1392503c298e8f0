//! Error kinds for the engine, each carrying enough context to explain itself (§7).

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("unable to initialize the model '{path}': {source}")]
    InitModel { path: String, source: String },

    #[error("unable to initialize the acoustic context: {source}")]
    InitContext { source: String },

    #[error("the provided model cannot translate")]
    ModelCannotTranslate,

    #[error("unable to initialize VAD: {source}")]
    InitVad { source: String },

    #[error("audio commit error: {source}")]
    AudioCommit { source: String },

    #[error("output queue is full, message dropped")]
    QueueFull,

    #[error("output channel closed")]
    OutputChannelClosed,
}
