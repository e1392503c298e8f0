//! The public handle (§4.6): `new`, `write_audio`, `output_chan`, `close`. Owns the background
//! decoder worker and enforces that the worker alone ever calls `decode()`.
//!
//! The worker takes `shared`'s lock twice per iteration (§5): once to snapshot the pending
//! buffer and run the VAD gate (`CommitState::prepare`), once to splice the decoded segments
//! back in (`CommitState::finish`). The acoustic model itself lives outside the mutex entirely —
//! it's moved into the worker task at spawn time and handed to `spawn_blocking` and back each
//! iteration, so `decode()` never runs with the lock held and `write_audio` never waits on it.

use crate::commit::{CommitConfig, CommitState, DecodeJob};
use crate::error::EngineError;
use crate::hallucination::ModelHash;
use crate::model::{AcousticModel, AlignmentAheadsPreset, ModelInitOptions, SamplingStrategy, Segment, WhisperModel};
use crate::pcm::{self, ITERATION_INTERVAL};
use crate::transcript::Transcript;
use crate::vad_gate::{DummyVad, EarshotVad, VadSource};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Bounded output queue capacity (§4.5); producer drops newest-on-overflow rather than block.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// A running streaming transcription session: one acoustic model, one sliding buffer, one
/// background decoder worker, one output channel.
pub struct Engine {
    shared: Arc<Mutex<CommitState>>,
    sticky_error: Arc<Mutex<Option<EngineError>>>,
    cancel: Arc<AtomicBool>,
    output: mpsc::Receiver<Transcript>,
}

impl Engine {
    /// Loads the model, wires the VAD gate, and starts the background worker.
    ///
    /// Fails with `InitModel`/`InitContext` if the model can't be loaded, or `ModelCannotTranslate`
    /// if `translate` is requested against a monolingual model.
    pub fn new(
        model_bytes: &[u8],
        language: Option<String>,
        sampling_strategy: SamplingStrategy,
        translate: bool,
        alignment_preset: AlignmentAheadsPreset,
        vad_threshold: f32,
        options: ModelInitOptions,
    ) -> Result<Self, EngineError> {
        let whisper_model = WhisperModel::init_from_bytes(model_bytes, options, alignment_preset, sampling_strategy)?;
        if translate && !whisper_model.is_multilingual() {
            return Err(EngineError::ModelCannotTranslate);
        }

        let model_hash: ModelHash = {
            let digest = Sha1::digest(model_bytes);
            let mut out = [0u8; 20];
            out.copy_from_slice(&digest);
            out
        };

        let vad: Box<dyn VadSource> = if vad_threshold > 0.0 { Box::new(EarshotVad) } else { Box::new(DummyVad) };
        let config = CommitConfig { language, translate, diarize: false, vad_threshold, model_hash };

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_abort = cancel.clone();

        let mut model: Box<dyn AcousticModel> = Box::new(whisper_model);
        model.set_abort_callback(Arc::new(move || cancel_for_abort.load(Ordering::Relaxed)));
        debug!(default_lang_id = model.default_lang_id(), "model loaded");

        let shared = Arc::new(Mutex::new(CommitState::new(vad, config)));
        let sticky_error = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        spawn_worker(shared.clone(), model, sticky_error.clone(), cancel.clone(), tx);

        Ok(Self { shared, sticky_error, cancel, output: rx })
    }

    /// Appends PCM bytes to the sliding buffer. Non-blocking beyond the brief buffer-only lock
    /// (§4.6): the worker never holds it across a decode, so this never waits out a multi-second
    /// `decode()` call. Fails if a previous decode has latched a sticky error.
    pub fn write_audio(&self, bytes: &[u8]) -> Result<(), EngineError> {
        if let Some(err) = self.sticky_error.lock().clone() {
            return Err(err);
        }
        self.shared.lock().append(bytes);
        Ok(())
    }

    /// The single consumer-facing receiver. Closes once the worker exits.
    pub fn output_chan(&mut self) -> &mut mpsc::Receiver<Transcript> {
        &mut self.output
    }

    /// Cancels the worker and releases the acoustic model. Idempotent.
    pub fn close(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bypasses `WhisperModel` loading to drive the engine with a scripted acoustic model and a
/// dummy VAD, for the end-to-end scenarios in the integration test suite (§8).
#[cfg(any(test, feature = "test-support"))]
impl Engine {
    pub fn from_parts(model: Box<dyn AcousticModel>, vad: Box<dyn VadSource>, config: CommitConfig) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Mutex::new(CommitState::new(vad, config)));
        let sticky_error = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        spawn_worker(shared.clone(), model, sticky_error.clone(), cancel.clone(), tx);

        Self { shared, sticky_error, cancel, output: rx }
    }
}

/// Outcome of one worker iteration, reported back to the loop driving `spawn_worker`.
enum IterationOutcome {
    Transcripts(Vec<Transcript>),
    DecodeFailed(EngineError),
    Panicked,
}

/// Runs one full iteration: snapshot (locked), decode (unlocked, on a blocking thread), splice
/// (locked). Returns the model back to the caller so the next iteration can reuse it — unless
/// the blocking task panicked and took it down with it.
async fn run_once(
    shared: &Mutex<CommitState>,
    model: Box<dyn AcousticModel>,
) -> (Option<Box<dyn AcousticModel>>, IterationOutcome) {
    let job = shared.lock().prepare();
    let Some(job) = job else {
        return (Some(model), IterationOutcome::Transcripts(Vec::new()));
    };

    // `decode()` is synchronous and CPU-bound; offloading it keeps the tokio runtime threads
    // free. The model travels into and back out of the blocking closure so the worker keeps
    // sole ownership of it between iterations without needing `Sync`.
    let blocking_result = tokio::task::spawn_blocking(move || {
        let mut model = model;
        let samples = pcm::bytes_to_f32_samples(&job.decoded);
        let result = model.decode(&job.params, &samples);
        (model, result, job)
    })
    .await;

    let (model, decode_result, job): (Box<dyn AcousticModel>, Result<(), EngineError>, DecodeJob) = match blocking_result
    {
        Ok(triple) => triple,
        Err(join_err) => {
            error!(%join_err, "decoder worker task panicked");
            return (None, IterationOutcome::Panicked);
        }
    };

    if let Err(err) = decode_result {
        return (Some(model), IterationOutcome::DecodeFailed(err));
    }

    let n = model.num_segments();
    let segments: Vec<Segment> = (0..n).map(|i| model.segment(i)).collect();
    let language = model.default_lang_str();

    let transcripts = shared.lock().finish(job, segments, language);
    (Some(model), IterationOutcome::Transcripts(transcripts))
}

fn spawn_worker(
    shared: Arc<Mutex<CommitState>>,
    model: Box<dyn AcousticModel>,
    sticky_error: Arc<Mutex<Option<EngineError>>>,
    cancel: Arc<AtomicBool>,
    tx: mpsc::Sender<Transcript>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ITERATION_INTERVAL);
        let mut model = model;
        loop {
            interval.tick().await;
            if cancel.load(Ordering::Relaxed) {
                break;
            }

            let (returned_model, outcome) = run_once(&shared, model).await;

            let transcripts = match outcome {
                IterationOutcome::Transcripts(transcripts) => transcripts,
                IterationOutcome::DecodeFailed(err) => {
                    error!(%err, "decode failed, worker stopping");
                    *sticky_error.lock() = Some(err);
                    break;
                }
                IterationOutcome::Panicked => break,
            };

            model = returned_model.expect("model survives a successful iteration");

            for transcript in transcripts {
                if tx.try_send(transcript).is_err() {
                    warn!("output channel full or closed, dropping transcript");
                }
            }
        }
    });
}
