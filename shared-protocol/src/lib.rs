use serde::{Deserialize, Serialize};

pub const FRAME_SIZE_CS: u32 = 6; // 2*30ms = 60ms (common Opus frame size)
pub const SAMPLE_RATE: u32 = 16000; // engine's native rate
pub const CS_SAMPLES: u32 = SAMPLE_RATE / 100; // 160 = 1 cs at 16kHz
pub const FRAME_SIZE_SAMPLES: u32 = FRAME_SIZE_CS * CS_SAMPLES; // 960

/// Max message size accepted over the wire (§6); larger payloads are a protocol error.
pub const MAX_MESSAGE_BYTES: usize = 1 << 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Sent once after connection, required before any audio frame.
    Configure {
        token: Option<String>,    // optional auth token
        language: Option<String>, // "xx-YY", empty/"auto" = auto-detect
        translate: Option<bool>,
        alignment_aheads_preset: Option<String>,
        vad_threshold: Option<f32>,
    },
    // No explicit AudioChunk message - binary frames (Opus-encoded) are implicitly audio.
    EndOfStream, // triggers a final, is_final=true flush
}

/// Wire mirror of `stt_engine::transcript::TranscriptToken`, nanosecond-resolution (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptToken {
    pub start_ns: u64,
    pub end_ns: u64,
    pub text: String,
    pub confidence: f32,
    pub speaker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptVariant {
    pub text: String,
    pub tokens: Vec<TranscriptToken>,
    pub confidence: f32,
}

/// Wire mirror of `stt_engine::transcript::Transcript`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub variants: Vec<TranscriptVariant>,
    pub is_final: bool,
    pub no_speech_probability: f32,
    pub language: String,
    pub channel_num: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Transcription { transcript: Transcript },
    Error { message: String },
}
