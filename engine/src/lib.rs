//! Streaming speech-to-text commitment engine: a sliding audio buffer, a periodic decode loop
//! that classifies and commits transcript segments, and a handle exposing the result as a
//! channel of [`transcript::Transcript`] messages.

pub mod buffer;
pub mod commit;
pub mod error;
pub mod hallucination;
pub mod handle;
pub mod model;
pub mod pcm;
pub mod transcript;
pub mod vad_gate;

pub use commit::CommitConfig;
pub use error::EngineError;
pub use handle::Engine;
pub use model::{AcousticModel, AlignmentAheadsPreset, ModelInitOptions, SamplingStrategy};
pub use transcript::{Transcript, TranscriptToken, TranscriptVariant};
