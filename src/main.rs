use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use whip_streamer::capture::FileCapturePlatform;
use whip_streamer::config::{self, RawSessionParameters};
use whip_streamer::events::SessionEvent;
use whip_streamer::session::{SessionEngine, SessionState};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// whip-streamer command line arguments
#[derive(Parser, Debug)]
#[command(name = "whip-streamer")]
#[command(version, about = "Stream a screen recording and audio to a WHIP ingest server", long_about = None)]
struct CliArgs {
    /// WHIP endpoint URL
    #[arg(short = 'u', long, value_name = "URL")]
    url: String,

    /// Stream key, appended to the endpoint path
    #[arg(short = 't', long, value_name = "TOKEN")]
    token: Option<String>,

    /// Audio source (mic, system, mix, none)
    #[arg(long, value_name = "MODE", default_value = "mic")]
    audio: String,

    /// Video codec (H264, VP8, VP9)
    #[arg(long, value_name = "CODEC", default_value = "H264")]
    codec: String,

    /// Stop if the ingest server does not accept the requested codec
    #[arg(long)]
    strict_codec: bool,

    /// Encoder preference (auto, hardware, software)
    #[arg(long, value_name = "MODE")]
    encoder_mode: Option<String>,

    #[arg(long, value_name = "PX")]
    width: Option<String>,

    #[arg(long, value_name = "PX")]
    height: Option<String>,

    #[arg(long, value_name = "FPS")]
    fps: Option<String>,

    /// Video bitrate in kbps
    #[arg(long, value_name = "KBPS")]
    video_bitrate: Option<String>,

    /// Audio bitrate in kbps
    #[arg(long, value_name = "KBPS")]
    audio_bitrate: Option<String>,

    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Recording to stream as the screen (.h264 or .ivf)
    #[arg(long, value_name = "FILE")]
    video_file: PathBuf,

    /// Pretend the platform supports playback loopback capture
    #[arg(long)]
    loopback: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl CliArgs {
    fn session_parameters(&self) -> RawSessionParameters {
        RawSessionParameters {
            url: Some(self.url.clone()),
            token: self.token.clone(),
            audio_source: Some(self.audio.clone()),
            video_codec: Some(self.codec.clone()),
            strict_codec: self.strict_codec,
            encoder_mode: self.encoder_mode.clone(),
            width: self.width.clone(),
            height: self.height.clone(),
            fps: self.fps.clone(),
            video_bitrate_kbps: self.video_bitrate.clone(),
            audio_bitrate_kbps: self.audio_bitrate.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting whip-streamer v{}", env!("CARGO_PKG_VERSION"));

    let streamer_config = config::load_or_default(args.config.as_deref()).await?;
    let params = args.session_parameters().resolve();

    let platform = Arc::new(FileCapturePlatform::new(&args.video_file, args.loopback));
    let grant = platform.request_capture();

    let engine = SessionEngine::with_platform(streamer_config, platform).await?;
    let mut events = engine.subscribe();

    let session_id = engine.start(params, Some(grant)).await?;
    tracing::info!("Session {} started", session_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                engine.stop();
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Streaming { codec, .. }) => {
                    tracing::info!("Live: streaming {}", codec);
                }
                Ok(SessionEvent::Stopped { reason, detail, .. }) => {
                    match detail {
                        Some(detail) => tracing::info!("Session stopped: {} ({})", reason, detail),
                        None => tracing::info!("Session stopped: {}", reason),
                    }
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    if engine.state() != SessionState::Stopped {
        tracing::warn!("Exiting with session in state {}", engine.state());
    }
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "whip_streamer=error,webrtc=error",
        LogLevel::Warn => "whip_streamer=warn,webrtc=warn",
        LogLevel::Info => "whip_streamer=info,webrtc=warn",
        LogLevel::Verbose => "whip_streamer=debug,webrtc=warn",
        LogLevel::Debug => "whip_streamer=debug,webrtc=info",
        LogLevel::Trace => "whip_streamer=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
