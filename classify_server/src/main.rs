//! Classification server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use clap::Parser;
use env_logger::TimestampPrecision;

use classify_server::{
    camera::CameraConfig,
    endpoints::{
        classify_image, healthcheck, index, prediction_stream, predictions, start_camera,
        stop_camera,
    },
    gateway::AssetLoader,
    meter::spawn_meter_logger,
    AppContext,
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the page and API on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Directory holding model.onnx and metadata.json
    #[clap(long, default_value = "model")]
    model_dir: PathBuf,

    /// Camera device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture width; device maximum if unset
    #[clap(long, requires = "height")]
    width: Option<u32>,

    /// Capture height; device maximum if unset
    #[clap(long, requires = "width")]
    height: Option<u32>,

    /// Capture frame rate; device maximum if unset
    #[clap(long)]
    frame_rate: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let resolution = match (args.width, args.height) {
        (Some(width), Some(height)) => Some((width, height)),
        _ => None,
    };
    let camera_config = CameraConfig {
        device: args.device,
        resolution,
        frame_rate: args.frame_rate,
    };

    let ctx = AppContext::new(Arc::new(AssetLoader::new(args.model_dir)), camera_config);

    spawn_meter_logger(Duration::from_secs(5));

    // Build HTTP server with endpoints
    let app = Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/classify_image", post(classify_image))
        .route("/camera/start", post(start_camera))
        .route("/camera/stop", post(stop_camera))
        .route("/predictions", get(predictions))
        .route("/predictions/stream", get(prediction_stream))
        .layer(Extension(ctx));

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
