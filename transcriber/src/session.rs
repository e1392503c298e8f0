use anyhow::Result;
use opus::{Channels, Decoder};
use shared_protocol::{FRAME_SIZE_SAMPLES, SAMPLE_RATE};
use stt_engine::model::{AlignmentAheadsPreset, ModelInitOptions, SamplingStrategy};
use stt_engine::{Engine, Transcript as EngineTranscript};

/// Per-connection state: an Opus decoder feeding a `stt_engine::Engine` handle. The engine owns
/// the sliding buffer, the decode loop, and the output channel; this wraps only what a network
/// connection needs that the engine itself doesn't know about: wire framing and Opus decode.
pub struct Session {
    engine: Engine,
    opus_decoder: Decoder,
}

impl Session {
    pub fn new(
        model_bytes: &[u8],
        language: Option<String>,
        translate: bool,
        alignment_preset: AlignmentAheadsPreset,
        vad_threshold: f32,
        sampling_strategy: SamplingStrategy,
        options: ModelInitOptions,
    ) -> Result<Self> {
        let engine =
            Engine::new(model_bytes, language, sampling_strategy, translate, alignment_preset, vad_threshold, options)?;
        let opus_decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)?;
        Ok(Self { engine, opus_decoder })
    }

    /// Decodes one Opus packet and appends the resulting PCM to the engine's sliding buffer.
    pub fn decode_and_append_opus(&mut self, packet: &[u8]) -> Result<()> {
        let mut output = vec![0i16; FRAME_SIZE_SAMPLES as usize];
        let samples_decoded = self.opus_decoder.decode(packet, &mut output, false)?;
        if samples_decoded != (FRAME_SIZE_SAMPLES as usize) {
            anyhow::bail!("decompressed to unexpected len {}", samples_decoded);
        }

        let mut pcm_bytes = Vec::with_capacity(output.len() * 4);
        for sample in output {
            let f = sample as f32 / 32768.0;
            pcm_bytes.extend_from_slice(&f.to_le_bytes());
        }
        self.engine.write_audio(&pcm_bytes)?;
        Ok(())
    }

    /// Drains whatever transcripts the engine has produced since the last poll, without blocking.
    pub fn drain_transcripts(&mut self) -> Vec<EngineTranscript> {
        let mut out = Vec::new();
        while let Ok(t) = self.engine.output_chan().try_recv() {
            out.push(t);
        }
        out
    }

    /// Awaits the next transcript the background worker produces; `None` once the engine closes.
    /// Lets the connection loop race this against inbound websocket frames instead of polling.
    pub async fn recv_transcript(&mut self) -> Option<EngineTranscript> {
        self.engine.output_chan().recv().await
    }

    pub fn close(&self) {
        self.engine.close();
    }
}

/// Converts the engine's internal transcript type to the wire format (§6), nanosecond timing.
pub fn to_wire(t: &EngineTranscript) -> shared_protocol::Transcript {
    shared_protocol::Transcript {
        variants: t
            .variants
            .iter()
            .map(|v| shared_protocol::TranscriptVariant {
                text: v.text.clone(),
                confidence: v.confidence,
                tokens: v
                    .tokens
                    .iter()
                    .map(|tok| shared_protocol::TranscriptToken {
                        start_ns: tok.start.as_nanos() as u64,
                        end_ns: tok.end.as_nanos() as u64,
                        text: tok.text.clone(),
                        confidence: tok.confidence,
                        speaker: tok.speaker.to_string(),
                    })
                    .collect(),
            })
            .collect(),
        is_final: t.is_final,
        no_speech_probability: t.no_speech_probability,
        language: t.language.clone(),
        channel_num: t.channel_count,
    }
}
