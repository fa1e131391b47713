//! Classify still images and live camera frames with a pre-trained ONNX
//! model and show the ranked results in the browser.

pub mod camera;
pub mod capture;
pub mod endpoints;
pub mod frame;
pub mod gateway;
pub mod meter;
pub mod nn;
pub mod render;

use std::sync::Arc;

use tokio::sync::Mutex;

use camera::CameraConfig;
use capture::CaptureController;
use frame::FrameBuffer;
use gateway::{ModelGateway, ModelLoader};
use render::PredictionRenderer;

/// Shared state of the whole service: the model gateway, the capture
/// controller, the rendered output surface and the frame buffer both
/// classification paths draw into.
pub struct AppContext {
    pub gateway: ModelGateway,
    pub capture: CaptureController,
    pub renderer: PredictionRenderer,
    pub frame: Mutex<FrameBuffer>,
    pub camera_config: CameraConfig,
}

impl AppContext {
    pub fn new(loader: Arc<dyn ModelLoader>, camera_config: CameraConfig) -> Arc<Self> {
        Arc::new(Self {
            gateway: ModelGateway::new(loader),
            capture: CaptureController::new(),
            renderer: PredictionRenderer::new(),
            frame: Mutex::new(FrameBuffer::new()),
            camera_config,
        })
    }
}
