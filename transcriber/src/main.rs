mod session;

use anyhow::Result;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use session::Session;
use shared_protocol::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use stt_engine::model::{AlignmentAheadsPreset, ModelInitOptions, SamplingStrategy};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

/// Wire-level cap matching `shared_protocol::MAX_MESSAGE_BYTES` (§6): oversize frames are a
/// protocol error, enforced by tungstenite itself rather than left to its own 16 MiB default.
fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(shared_protocol::MAX_MESSAGE_BYTES),
        max_frame_size: Some(shared_protocol::MAX_MESSAGE_BYTES),
        ..Default::default()
    }
}

#[derive(Parser, Debug)]
#[command(name = "transcriber")]
struct Args {
    #[arg(short, long, default_value = "[::]", help = "address to listen on")]
    address: String,

    #[arg(short, long, default_value = "8001", help = "port to listen on")]
    port: u16,

    #[arg(short, long, help = "path to whisper model file")]
    model: String,

    #[arg(long, help = "path to optional API token")]
    token_file: Option<String>,

    #[arg(long, default_value_t = 0.0, help = "default VAD threshold when a client doesn't specify one (0.0 disables the gate)")]
    vad_threshold: f32,

    #[arg(long, default_value = "none", help = "default alignment-aheads preset when a client doesn't specify one")]
    alignment_aheads_preset: String,

    #[arg(
        long,
        help = "Best-of (default: 1, mutually exclusive with --beam-size)",
        conflicts_with = "beam_size"
    )]
    best_of: Option<i32>,
    #[arg(long, help = "Beam search size (mutually exclusive with --best-of)", conflicts_with = "best_of")]
    beam_size: Option<i32>,

    #[arg(long, help = "GPU device index to use (-1 or absent = CPU)")]
    gpu: Option<i32>,

    #[arg(long, default_value_t = 64, help = "maximum number of concurrent contexts before new connections are refused")]
    max_contexts: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    info!("Loading whisper model: {}", args.model);
    let model_bytes = Arc::new(std::fs::read(&args.model)?);

    let expected_token = match &args.token_file {
        Some(path) => {
            info!("API token authentication enabled");
            Some(
                std::fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e)),
            )
        }
        None => None,
    };

    let sampling_strategy = match (args.beam_size, args.best_of) {
        (Some(beam_size), None) => {
            info!("Using beam search with beam_size={}", beam_size);
            SamplingStrategy::BeamSearch { beam_size, patience: -1.0 }
        }
        (None, Some(best_of)) => {
            info!("Using greedy search with best_of={}", best_of);
            SamplingStrategy::Greedy { best_of }
        }
        (None, None) => {
            info!("Using greedy search with best_of=1 (default)");
            SamplingStrategy::Greedy { best_of: 1 }
        }
        (Some(_), Some(_)) => unreachable!("beam_size and best_of are mutually exclusive"),
    };

    let default_alignment = AlignmentAheadsPreset::parse(&args.alignment_aheads_preset)
        .unwrap_or(AlignmentAheadsPreset::None);
    let gpu_options = ModelInitOptions {
        use_gpu: Some(args.gpu.is_some()),
        gpu_device: args.gpu,
        flash_attn: Some(args.gpu.is_some()),
    };

    let contexts = Arc::new(Semaphore::new(args.max_contexts));

    info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("Connection from {}", peer_addr);
        let model_bytes = model_bytes.clone();
        let exp_token = expected_token.clone();
        let strategy = sampling_strategy.clone();
        let gpu_options = gpu_options;
        let contexts = contexts.clone();
        let default_vad_threshold = args.vad_threshold;
        let default_alignment = default_alignment;

        tokio::spawn(async move {
            let Ok(permit) = contexts.try_acquire_owned() else {
                warn_and_drop(stream).await;
                return;
            };
            if let Err(e) = handle_connection(
                stream,
                model_bytes,
                exp_token,
                strategy,
                gpu_options,
                default_vad_threshold,
                default_alignment,
            )
            .await
            {
                error!("Connection error: {}", e);
            }
            drop(permit);
        });
    }
    Ok(())
}

/// Refuses a connection once `--max-contexts` concurrent sessions are already running (§4.7).
async fn warn_and_drop(stream: TcpStream) {
    if let Ok(mut ws) = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await {
        let msg = ServerMessage::Error { message: "resource exhausted: too many concurrent contexts".to_string() };
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = ws.send(Message::Text(json)).await;
        }
        let _ = ws.send(Message::Close(None)).await;
    }
}

macro_rules! bail {
    ($ws_sender:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        let m = ServerMessage::Error { message: msg.clone() };
        let m = serde_json::to_string(&m).unwrap();
        let _ = $ws_sender.send(Message::Text(m)).await;
        let _ = $ws_sender.send(Message::Close(None)).await;
        return Err(anyhow::anyhow!(msg));
    }};
}

async fn handle_connection(
    stream: TcpStream,
    model_bytes: Arc<Vec<u8>>,
    expected_token: Option<String>,
    sampling_strategy: SamplingStrategy,
    gpu_options: ModelInitOptions,
    default_vad_threshold: f32,
    default_alignment: AlignmentAheadsPreset,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // First wait for the mandatory Configure message:
    let (token, language, translate, alignment_aheads_preset, vad_threshold) = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Configure { token, language, translate, alignment_aheads_preset, vad_threshold }) => {
                (token, language, translate, alignment_aheads_preset, vad_threshold)
            }
            Ok(_) => bail!(ws_sender, "first message must be Configure"),
            Err(e) => bail!(ws_sender, "failed to parse Configure : {}", e),
        },
        Some(Ok(_)) => bail!(ws_sender, "must send Configure first"),
        Some(Err(e)) => bail!(ws_sender, "pre-configure error {}", e),
        None => bail!(ws_sender, "connection closed before Configure"),
    };

    if let Some(ref expected) = expected_token {
        match token {
            Some(ref t) if t == expected => (),
            Some(_) => bail!(ws_sender, "wrong API token"),
            None => bail!(ws_sender, "missing API token"),
        }
    }

    let translate = translate.unwrap_or(false);
    let vad_threshold = vad_threshold.unwrap_or(default_vad_threshold);
    let alignment_preset = alignment_aheads_preset
        .as_deref()
        .and_then(AlignmentAheadsPreset::parse)
        .unwrap_or(default_alignment);

    info!("Configured: language={:?}, translate={}, vad_threshold={}", language, translate, vad_threshold);

    let mut session = match Session::new(
        &model_bytes,
        language,
        translate,
        alignment_preset,
        vad_threshold,
        sampling_strategy,
        gpu_options,
    ) {
        Ok(s) => s,
        Err(e) => bail!(ws_sender, "error creating session: {}", e),
    };

    // Audio arrives as inbound websocket frames; transcripts arrive independently from the
    // engine's background decoder worker. Race both so a quiet client never delays delivery
    // of a transcript the worker has already produced.
    let mut finalized = false;
    while !finalized {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Configure { .. }) => bail!(ws_sender, "Configure sent after session started"),
                        Ok(ClientMessage::EndOfStream) => {
                            info!("end of audio stream");
                            finalized = true;
                        }
                        Err(e) => bail!(ws_sender, "cannot parse message: {}", e),
                    },
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = session.decode_and_append_opus(&data) {
                            bail!(ws_sender, "error decoding Opus: {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => bail!(ws_sender, "connection closed"),
                    Some(Err(e)) => bail!(ws_sender, "websocket error: {}", e),
                }
            }
            transcript = session.recv_transcript() => {
                let Some(transcript) = transcript else { bail!(ws_sender, "engine closed unexpectedly") };
                let msg = ServerMessage::Transcription { transcript: session::to_wire(&transcript) };
                let json = serde_json::to_string(&msg)?;
                ws_sender.send(Message::Text(json)).await?;
            }
        }
    }

    // EndOfStream doesn't mean the worker is done: audio already buffered still needs its
    // remaining decode iterations to run. Keep forwarding transcripts until the worker goes
    // quiet for a couple of iteration intervals, then close.
    let quiet_timeout = stt_engine::pcm::ITERATION_INTERVAL * 3;
    loop {
        match tokio::time::timeout(quiet_timeout, session.recv_transcript()).await {
            Ok(Some(transcript)) => {
                let msg = ServerMessage::Transcription { transcript: session::to_wire(&transcript) };
                let json = serde_json::to_string(&msg)?;
                ws_sender.send(Message::Text(json)).await?;
            }
            Ok(None) | Err(_) => break,
        }
    }

    session.close();
    ws_sender.send(Message::Close(None)).await?;
    info!("Session ended");
    Ok(())
}
