//! Mood server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use mood_server::{
    app::{spawn_player_events, MoodApp},
    endpoints::router,
    frames::FrameHub,
    meter::spawn_meter_logger,
    nn::FaceExpressionModel,
    player::RodioOutput,
    sensors::{get_capture_fn_linux, spawn_capture_loop, CameraSettings},
    songs::{SongsClient, DEFAULT_API_BASE_URL},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address the HTTP server listens on
    #[clap(long, default_value = "127.0.0.1:8080")]
    server_address: String,

    /// Base URL of the songs backend serving `/songs?mood=<mood>`
    #[clap(long, env = "API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution as `<width>x<height>`, the maximum supported if not set
    #[clap(long, value_parser = parse_pair::<'x'>)]
    resolution: Option<(u32, u32)>,

    /// Capture interval as `<numerator>/<denominator>` seconds, the fastest supported if not set
    #[clap(long, value_parser = parse_pair::<'/'>)]
    frame_interval: Option<(u32, u32)>,

    /// Directory holding the ONNX models
    #[clap(long)]
    model_dir: Option<PathBuf>,

    /// Fail instead of downloading missing models
    #[clap(long)]
    no_download: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let model_dir = match args.model_dir {
        Some(model_dir) => model_dir,
        None => dirs::cache_dir()
            .ok_or_else(|| anyhow!("no cache directory, pass --model-dir"))?
            .join("mood_server"),
    };
    let detector = Arc::new(FaceExpressionModel::load(&model_dir, !args.no_download).await?);

    // Start capturing frames from the webcam
    let frames = FrameHub::new();
    let settings = CameraSettings {
        device: args.device,
        resolution: args.resolution,
        frame_rate: args.frame_interval,
        ..Default::default()
    };
    let capture_fn = get_capture_fn_linux(&settings)
        .map_err(|e| anyhow!("Unable to access webcam: {e}"))?;
    spawn_capture_loop(capture_fn, frames.clone());

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let output = Arc::new(RodioOutput::spawn(events_tx)?);

    let songs = SongsClient::new(&args.api_base_url)?;
    log::info!("Using songs backend at {}", &args.api_base_url);

    let app = Arc::new(MoodApp::new(detector, frames, songs, output));
    spawn_player_events(Arc::clone(&app), events_rx);

    spawn_meter_logger();

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(router(app).into_make_service())
        .await?;

    Ok(())
}

/// Parse two numbers separated by `SEP`, e.g. `1280x720`.
fn parse_pair<const SEP: char>(s: &str) -> Result<(u32, u32), String> {
    let (a, b) = s
        .split_once(SEP)
        .ok_or_else(|| format!("expected two numbers separated by '{}'", SEP))?;
    let a = a.trim().parse().map_err(|e| format!("{a:?}: {e}"))?;
    let b = b.trim().parse().map_err(|e| format!("{b:?}: {e}"))?;

    Ok((a, b))
}
