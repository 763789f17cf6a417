// src/main.rs
//
// CLI entry point (§6). Two modes: `record` drives the live desktop-capture
// pipeline with a keypress driver (`s` start, `q` stop, `x` exit) and a
// terminating-signal handler that both call `Pipeline::stop()`; `hls` runs
// the file-to-HLS transcoder once and then serves the result until killed.
// clap derive CLI, tracing-subscriber with EnvFilter, tokio::signal for
// shutdown.

mod pipeline;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use scrycast_core::config::{load_hls_config, load_record_config};
use scrycast_media::{HlsTranscodeConfig, HlsTranscoder};
use scrycast_server::{serve, HlsServerConfig};

use pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "scrycast")]
#[command(about = "Desktop capture/stream pipeline and file-to-HLS transcoder")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live desktop + audio capture, writing to a file and/or an RTMP sink.
    Record {
        /// Path to a `scrycast.toml` config file (defaults applied if absent).
        #[arg(short, long, default_value = "scrycast.toml")]
        config: PathBuf,
    },
    /// Transcode an existing media file into an HLS playlist and serve it.
    Hls {
        /// Path to a `scrycast_hls.toml` config file (defaults applied if absent).
        #[arg(short, long, default_value = "scrycast_hls.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    ffmpeg_the_third::init()?;

    let args = Args::parse();
    match args.command {
        Command::Record { config } => run_record(&config),
        Command::Hls { config } => run_hls(&config),
    }
}

fn run_record(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = load_record_config(config_path)?;
    let mut pipeline = Pipeline::new(config);
    // §4.8 Idle -> Initialized: fail fast on a bad region/config shape
    // before `s` opens any capture device.
    pipeline.init()?;
    let pipeline = Arc::new(std::sync::Mutex::new(pipeline));

    {
        let pipeline = pipeline.clone();
        ctrlc::set_handler(move || {
            tracing::info!("signal received, stopping pipeline");
            pipeline.lock().unwrap().stop();
        })?;
    }

    tracing::info!("ready: press 's' to start, 'q' to stop, 'x' to exit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "s" => {
                let mut p = pipeline.lock().unwrap();
                if let Err(e) = p.start() {
                    tracing::error!(error = %e, "failed to start pipeline");
                } else {
                    tracing::info!("recording started");
                }
            }
            "q" => {
                pipeline.lock().unwrap().stop();
                tracing::info!("recording stopped");
            }
            "x" => {
                pipeline.lock().unwrap().stop();
                break;
            }
            other => tracing::warn!(input = other, "unrecognized command (use s/q/x)"),
        }
    }

    Ok(())
}

fn run_hls(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = load_hls_config(config_path)?;

    std::fs::create_dir_all(&config.hls_dir)?;
    let transcoder = HlsTranscoder::new(HlsTranscodeConfig {
        input_path: config.video_path.clone(),
        hls_dir: config.hls_dir.clone(),
        playlist_name: config.m3u8_filename.clone(),
        segment_duration_secs: config.segment_duration_secs,
        segment_list_size: 0,
        delete_old_segments: config.clean_old_segments,
        video_bitrate: config.video_bitrate,
        audio_bitrate: config.audio_bitrate,
        max_reconvert_attempts: config.max_reconvert_attempts,
        force_reconvert: config.force_reconvert,
        check_integrity: config.check_hls_integrity,
    });
    transcoder.run()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.http_threads.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server_config = HlsServerConfig {
            bind_addr: ([0, 0, 0, 0], config.http_port).into(),
            hls_dir: config.hls_dir,
            playlist_name: config.m3u8_filename,
        };

        tokio::select! {
            res = serve(server_config) => res,
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
