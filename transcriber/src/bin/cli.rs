//! Thin driver (§6): feeds raw native-format PCM from stdin into either a local engine or a
//! remote transcriber over the existing WebSocket protocol, printing transcripts to stdout.
//! Not part of the core; exists so the engine and the RPC adapter can be exercised by hand.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use opus::{Application, Channels, Encoder};
use shared_protocol::{ClientMessage, ServerMessage, FRAME_SIZE_SAMPLES, SAMPLE_RATE};
use std::io::Read;
use stt_engine::model::{AlignmentAheadsPreset, ModelInitOptions, SamplingStrategy};
use stt_engine::{Engine, Transcript};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(name = "transcriber-cli")]
struct Args {
    /// Path to the whisper model file.
    model: String,
    /// Accepted and logged only; fetching/decoding media is out of scope.
    media_url: Option<String>,

    #[arg(long, default_value = "en-US")]
    language: String,
    #[arg(long, default_value_t = false)]
    translate: bool,
    #[arg(long, default_value = "none")]
    alignment_aheads_preset: String,
    #[arg(long, default_value_t = -1)]
    gpu: i32,
    #[arg(long)]
    remote_addr: Option<String>,
    #[arg(long, default_value_t = 0.0)]
    vad_threshold: f32,

    #[arg(long, default_value_t = false)]
    print_timestamps: bool,
    #[arg(long, default_value_t = false)]
    print_confidences: bool,
    #[arg(long, default_value_t = false)]
    print_token_timestamps: bool,
    #[arg(long, default_value_t = false)]
    print_entropy: bool,
    #[arg(long, default_value_t = false)]
    print_no_speech_probability: bool,
}

fn lang_family(lang: &str) -> String {
    lang.split('-').next().unwrap_or(lang).to_string()
}

fn shannon_entropy_bits(s: &str) -> f64 {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for &c in &chars {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    let len = chars.len() as f64;
    counts.values().map(|&count| {
        let p = count as f64 / len;
        -p * p.log2()
    }).sum()
}

fn print_transcript(t: &Transcript, args: &Args) {
    let Some(variant) = t.primary() else { return };
    let marker = if t.is_final { "FINAL" } else { "..." };
    print!("[{marker}] {}", variant.text);
    if args.print_confidences {
        print!(" (confidence={:.3})", variant.confidence);
    }
    if args.print_no_speech_probability {
        print!(" (no_speech={:.3})", t.no_speech_probability);
    }
    if args.print_entropy {
        print!(" (entropy={:.2}b)", shannon_entropy_bits(&variant.text));
    }
    if args.print_timestamps && !variant.tokens.is_empty() {
        let start = variant.tokens.first().unwrap().start;
        let end = variant.tokens.last().unwrap().end;
        print!(" [{:.2}s-{:.2}s]", start.as_secs_f32(), end.as_secs_f32());
    }
    println!();
    if args.print_token_timestamps {
        for tok in &variant.tokens {
            println!(
                "    {:.2}s-{:.2}s {:?} (p={:.2})",
                tok.start.as_secs_f32(),
                tok.end.as_secs_f32(),
                tok.text,
                tok.confidence
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Some(url) = &args.media_url {
        tracing::info!(url, "media URL accepted but not fetched; stdin is the only audio source");
    }

    if let Some(addr) = args.remote_addr.clone() {
        run_remote(addr, args).await
    } else {
        run_local(args).await
    }
}

async fn run_local(args: Args) -> Result<()> {
    let model_bytes = std::fs::read(&args.model).with_context(|| format!("reading model file {}", args.model))?;
    let alignment = AlignmentAheadsPreset::parse(&args.alignment_aheads_preset).unwrap_or(AlignmentAheadsPreset::None);
    let gpu_opts = ModelInitOptions {
        use_gpu: Some(args.gpu >= 0),
        gpu_device: if args.gpu >= 0 { Some(args.gpu) } else { None },
        flash_attn: Some(args.gpu >= 0),
    };
    let language = Some(lang_family(&args.language));

    let mut engine = Engine::new(
        &model_bytes,
        language,
        SamplingStrategy::Greedy { best_of: 1 },
        args.translate,
        alignment,
        args.vad_threshold,
        gpu_opts,
    )?;

    let mut stdin = std::io::stdin();
    let chunk_bytes = stt_engine::pcm::BYTES_PER_SECOND as usize; // 1s chunks
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut frame = buf[..n].to_vec();
        frame.truncate(n - (n % 4));
        if !frame.is_empty() {
            engine.write_audio(&frame)?;
        }
        while let Ok(t) = engine.output_chan().try_recv() {
            print_transcript(&t, &args);
        }
    }
    engine.close();
    while let Some(t) = engine.output_chan().recv().await {
        print_transcript(&t, &args);
    }
    Ok(())
}

async fn run_remote(addr: String, args: Args) -> Result<()> {
    let url = format!("ws://{addr}");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.with_context(|| format!("connecting to {url}"))?;
    let (mut sender, mut receiver) = ws_stream.split();

    let configure = ClientMessage::Configure {
        token: None,
        language: Some(args.language.clone()),
        translate: Some(args.translate),
        alignment_aheads_preset: Some(args.alignment_aheads_preset.clone()),
        vad_threshold: Some(args.vad_threshold),
    };
    sender.send(Message::Text(serde_json::to_string(&configure)?)).await?;

    let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
    let frame_samples = FRAME_SIZE_SAMPLES as usize;

    let stdin_task = tokio::spawn(async move {
        let mut stdin = std::io::stdin();
        let mut pcm_buf = vec![0u8; frame_samples * 4];
        let mut opus_out = vec![0u8; 4000];
        loop {
            let mut filled = 0;
            while filled < pcm_buf.len() {
                match stdin.read(&mut pcm_buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(_) => break,
                }
            }
            if filled == 0 {
                break;
            }
            if filled < pcm_buf.len() {
                pcm_buf[filled..].fill(0); // pad the final partial frame with silence
            }
            let samples: Vec<i16> = pcm_buf
                .chunks_exact(4)
                .map(|c| (f32::from_le_bytes([c[0], c[1], c[2], c[3]]).clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            let Ok(len) = encoder.encode(&samples, &mut opus_out) else { break };
            if sender.send(Message::Binary(opus_out[..len].to_vec())).await.is_err() {
                break;
            }
            if filled < pcm_buf.len() {
                break;
            }
        }
        let eos = ClientMessage::EndOfStream;
        if let Ok(json) = serde_json::to_string(&eos) {
            let _ = sender.send(Message::Text(json)).await;
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Transcription { transcript }) => {
                    let t = Transcript {
                        variants: transcript
                            .variants
                            .into_iter()
                            .map(|v| stt_engine::TranscriptVariant {
                                text: v.text,
                                confidence: v.confidence,
                                tokens: v
                                    .tokens
                                    .into_iter()
                                    .map(|tok| stt_engine::TranscriptToken {
                                        start: std::time::Duration::from_nanos(tok.start_ns),
                                        end: std::time::Duration::from_nanos(tok.end_ns),
                                        text: tok.text,
                                        confidence: tok.confidence,
                                        speaker: if tok.speaker == ">" { ">" } else { "<" },
                                    })
                                    .collect(),
                            })
                            .collect(),
                        is_final: transcript.is_final,
                        no_speech_probability: transcript.no_speech_probability,
                        language: transcript.language,
                        channel_count: transcript.channel_num,
                    };
                    print_transcript(&t, &args);
                }
                Ok(ServerMessage::Error { message }) => bail!("server error: {message}"),
                Err(e) => bail!("failed to parse server message: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = stdin_task.await;
    Ok(())
}
