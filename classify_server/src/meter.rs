//! Throughput metering for the capture loop.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    captured: AtomicU64,
    classified: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured: AtomicU64::new(0),
            classified: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_classified(&self) {
        self.classified.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self) -> (u64, u64) {
        (
            self.captured.swap(0, Ordering::Relaxed),
            self.classified.swap(0, Ordering::Relaxed),
        )
    }
}

/// Periodically log capture and classification rates while frames flow.
pub fn spawn_meter_logger(period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.tick().await;

        loop {
            let start = Instant::now();
            tick.tick().await;

            let (captured, classified) = METER.drain();
            let elapsed = start.elapsed().as_secs_f32();
            if captured > 0 {
                log::info!("Capture rate: {:.1} fps", captured as f32 / elapsed);
            }
            if classified > 0 {
                log::info!("Classification rate: {:.1} fps", classified as f32 / elapsed);
            }
        }
    })
}
