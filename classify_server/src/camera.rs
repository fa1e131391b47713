//! Camera acquisition via V4L2.
//!
use image::RgbImage;
use rscam::{Camera, Config, IntervalInfo, ResolutionInfo};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capture format requested from the device.
const CAPTURE_FORMAT: &[u8] = b"MJPG";

/// Depth of the frame channel; the pump drops frames while it is full.
const FRAME_CHANNEL_DEPTH: usize = 2;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("failed to open camera {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("failed to negotiate capture parameters on {device}: {reason}")]
    Negotiate { device: String, reason: String },
    #[error("failed to start capture on {device}: {reason}")]
    Start { device: String, reason: String },
    #[error("camera task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Video device path, e.g. `/dev/video0`.
    pub device: String,
    /// Requested resolution; device maximum when unset.
    pub resolution: Option<(u32, u32)>,
    /// Requested frames per second; device maximum when unset.
    pub frame_rate: Option<u32>,
}

/// Consumer half of an active camera: decoded frames plus the negotiated
/// native dimensions. Frame arrival is the pacing primitive of the capture
/// loop; dropping the stream closes the channel and stops the pump.
pub struct FrameStream {
    rx: mpsc::Receiver<RgbImage>,
    native: Option<(u32, u32)>,
}

impl FrameStream {
    /// Build a stream from an externally-fed channel.
    pub fn from_channel(rx: mpsc::Receiver<RgbImage>, native: Option<(u32, u32)>) -> Self {
        Self { rx, native }
    }

    /// Native source dimensions, if known.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.native
    }

    /// Wait for the next decoded frame; `None` once the source is gone.
    pub async fn next_frame(&mut self) -> Option<RgbImage> {
        self.rx.recv().await
    }
}

/// Open the device, negotiate capture parameters and start the frame pump.
///
/// Blocks on device IO; call it from the blocking pool.
pub fn open_camera(config: &CameraConfig) -> Result<FrameStream, CameraError> {
    let mut cam = Camera::new(&config.device).map_err(|err| CameraError::Open {
        device: config.device.clone(),
        reason: err.to_string(),
    })?;

    let resolution = match config.resolution {
        Some(resolution) => resolution,
        None => max_resolution(&cam, &config.device)?,
    };
    let interval = match config.frame_rate {
        Some(fps) if fps > 0 => (1, fps),
        _ => best_interval(&cam, &config.device, resolution)?,
    };

    cam.start(&Config {
        interval,
        resolution,
        format: CAPTURE_FORMAT,
        ..Default::default()
    })
    .map_err(|err| CameraError::Start {
        device: config.device.clone(),
        reason: err.to_string(),
    })?;

    log::info!(
        "Camera {} capturing {}x{} at {}/{} s frame interval",
        config.device,
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
    let device = config.device.clone();
    std::thread::spawn(move || pump_frames(&device, cam, tx));

    Ok(FrameStream {
        rx,
        native: Some(resolution),
    })
}

/// Capture, decode and forward frames until the consumer goes away.
fn pump_frames(device: &str, cam: Camera, tx: mpsc::Sender<RgbImage>) {
    while !tx.is_closed() {
        let frame = match cam.capture() {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("Capture on {device} failed: {err}");
                break;
            }
        };
        let image = match image::load_from_memory(&frame[..]) {
            Ok(image) => image.to_rgb8(),
            Err(err) => {
                log::debug!("Skipping undecodable frame from {device}: {err}");
                continue;
            }
        };
        // Consumer busy: drop the frame rather than queue stale ones.
        let _ = tx.try_send(image);
    }
    log::debug!("Frame pump for {device} stopped");
}

/// Highest advertised resolution for the capture format.
fn max_resolution(cam: &Camera, device: &str) -> Result<(u32, u32), CameraError> {
    let info = cam
        .resolutions(CAPTURE_FORMAT)
        .map_err(|err| CameraError::Negotiate {
            device: device.to_owned(),
            reason: err.to_string(),
        })?;

    let resolution = match info {
        ResolutionInfo::Discretes(options) => options
            .into_iter()
            .max_by_key(|&(w, h)| w as u64 * h as u64),
        ResolutionInfo::Stepwise { max, .. } => Some(max),
    };

    resolution.ok_or_else(|| CameraError::Negotiate {
        device: device.to_owned(),
        reason: "no resolution advertised".to_owned(),
    })
}

/// Shortest advertised frame interval (highest rate) for the resolution.
fn best_interval(
    cam: &Camera,
    device: &str,
    resolution: (u32, u32),
) -> Result<(u32, u32), CameraError> {
    let info = cam
        .intervals(CAPTURE_FORMAT, resolution)
        .map_err(|err| CameraError::Negotiate {
            device: device.to_owned(),
            reason: err.to_string(),
        })?;

    let interval = match info {
        IntervalInfo::Discretes(options) => options
            .into_iter()
            .max_by_key(|&(num, den)| den as u64 * 1000 / num.max(1) as u64),
        IntervalInfo::Stepwise { max, .. } => Some(max),
    };

    interval.ok_or_else(|| CameraError::Negotiate {
        device: device.to_owned(),
        reason: "no frame interval advertised".to_owned(),
    })
}
