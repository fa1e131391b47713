//! Capture loop controller.
//!
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    camera::{self, CameraConfig, CameraError, FrameStream},
    meter::METER,
    AppContext,
};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera session already active")]
    AlreadyActive,
    #[error(transparent)]
    Camera(#[from] CameraError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// The live capture session. Its presence in the controller is the sole
/// condition gating loop continuation; the flag lets an in-flight loop
/// iteration observe a stop request.
struct Session {
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Idle/Capturing state machine around the camera loop.
///
/// At most one session is live at a time. Cancellation is cooperative: the
/// loop polls the session flag at the top of each iteration, so at most one
/// already-started classify/render pair completes after a stop request.
#[derive(Default)]
pub struct CaptureController {
    session: Mutex<Option<Session>>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> CaptureState {
        if self.session.lock().await.is_some() {
            CaptureState::Capturing
        } else {
            CaptureState::Idle
        }
    }

    /// Acquire the camera and begin the capture loop.
    ///
    /// Camera failure is terminal for this attempt: no session is created
    /// and the caller reports the error to the user. The model is warmed up
    /// front like the still-image path does; its failure is logged and
    /// surfaced through the gateway state but does not prevent the loop,
    /// which classifies as a soft no-op until a later acquire succeeds.
    pub async fn start(
        &self,
        ctx: Arc<AppContext>,
        config: CameraConfig,
    ) -> Result<(), CaptureError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(CaptureError::AlreadyActive);
        }

        let stream = tokio::task::spawn_blocking(move || camera::open_camera(&config))
            .await
            .map_err(|err| CameraError::Internal(err.to_string()))??;

        let _ = ctx.gateway.acquire().await;

        *session = Some(spawn_loop(ctx, stream));
        Ok(())
    }

    /// Begin the capture loop over an already-open frame stream.
    pub async fn start_with_stream(
        &self,
        ctx: Arc<AppContext>,
        stream: FrameStream,
    ) -> Result<(), CaptureError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(CaptureError::AlreadyActive);
        }
        *session = Some(spawn_loop(ctx, stream));
        Ok(())
    }

    /// Clear the session; the loop observes the flag and halts.
    ///
    /// Returns the loop task handle when a session was actually stopped.
    pub async fn stop(&self) -> Option<JoinHandle<()>> {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(Session { live, task }) => {
                live.store(false, Ordering::Relaxed);
                log::info!("Capture session stopped");
                Some(task)
            }
            None => None,
        }
    }

    /// Drop the session owning `live`, unless a newer one replaced it.
    async fn clear_session(&self, live: &Arc<AtomicBool>) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if Arc::ptr_eq(&current.live, live) {
                *session = None;
            }
        }
    }
}

fn spawn_loop(ctx: Arc<AppContext>, stream: FrameStream) -> Session {
    let live = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&live);
    let task = tokio::spawn(run_loop(ctx, stream, flag));
    Session { live, task }
}

/// Drive capture -> normalize -> classify -> render until stopped.
///
/// Strictly sequential: the next iteration is not scheduled until the
/// current normalize/classify/render chain has fully resolved, so
/// inference calls never overlap and the shared frame buffer is never
/// written while being read. Pacing comes from frame arrival, not a timer.
async fn run_loop(ctx: Arc<AppContext>, mut stream: FrameStream, live: Arc<AtomicBool>) {
    log::info!("Capture loop started");
    loop {
        // Sole cancellation point; an iteration already past it finishes
        // its classify/render pair.
        if !live.load(Ordering::Relaxed) {
            break;
        }

        let Some(frame) = stream.next_frame().await else {
            log::warn!("Camera frame stream ended");
            break;
        };
        METER.tick_captured();

        let mut buffer = ctx.frame.lock().await;
        buffer.normalize(&frame, stream.dimensions());
        let predictions = ctx.gateway.classify(&buffer).await;
        if !predictions.is_empty() {
            ctx.renderer.render(&predictions);
            METER.tick_classified();
        }
    }

    ctx.capture.clear_session(&live).await;
    log::info!("Capture loop stopped");
}
