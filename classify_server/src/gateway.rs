//! Lazy single-shot model acquisition.
//!
use std::{path::PathBuf, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    frame::FrameBuffer,
    nn::{ImageClassifier, ModelError, OnnxClassifier, Prediction},
};

/// Produces a classifier on demand.
///
/// The gateway only ever calls this while nothing is cached, so a loader
/// observing more than one call per successful load indicates a bug.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Box<dyn ImageClassifier>, ModelError>;
}

/// Loads the on-disk bundle from a fixed base directory.
pub struct AssetLoader {
    base: PathBuf,
}

impl AssetLoader {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }
}

impl ModelLoader for AssetLoader {
    fn load(&self) -> Result<Box<dyn ImageClassifier>, ModelError> {
        Ok(Box::new(OnnxClassifier::load(&self.base)?))
    }
}

/// Observable acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Loading,
    Ready,
    Failed,
}

enum Slot {
    Empty,
    Ready(Arc<dyn ImageClassifier>),
    /// Last attempt failed; kept for observability, retried on next acquire.
    Failed(String),
}

/// Single-acquisition cache for the model handle.
///
/// The slot lock is held across the load, so overlapping `acquire` calls
/// wait for the first in-flight load instead of starting their own; every
/// caller receives the same handle. A failed load never poisons the slot.
pub struct ModelGateway {
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Slot>,
}

impl ModelGateway {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Return the model handle, loading it exactly once on first use.
    pub async fn acquire(&self) -> Result<Arc<dyn ImageClassifier>, ModelError> {
        let mut slot = self.slot.lock().await;
        if let Slot::Ready(model) = &*slot {
            return Ok(Arc::clone(model));
        }
        if let Slot::Failed(reason) = &*slot {
            log::debug!("Retrying model load after failure: {reason}");
        }

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|err| ModelError::Internal(err.to_string()))?;

        match loaded {
            Ok(model) => {
                let model: Arc<dyn ImageClassifier> = Arc::from(model);
                log::info!("Model loaded. Classes: {}", model.class_count());
                *slot = Slot::Ready(Arc::clone(&model));
                Ok(model)
            }
            Err(err) => {
                log::error!("Failed to load model: {err}");
                *slot = Slot::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Classify the frame buffer, acquiring the model first if needed.
    ///
    /// Acquisition or inference failure yields an empty list instead of an
    /// error so the rendering path and the capture loop stay alive; the
    /// cause has already been logged.
    pub async fn classify(&self, frame: &FrameBuffer) -> Vec<Prediction> {
        let model = match self.acquire().await {
            Ok(model) => model,
            Err(_) => return Vec::new(),
        };
        match model.classify(frame) {
            Ok(predictions) => predictions,
            Err(err) => {
                log::warn!("Classification failed: {err}");
                Vec::new()
            }
        }
    }

    /// Current acquisition state; `Loading` while a load is in flight.
    pub fn state(&self) -> GatewayState {
        match self.slot.try_lock() {
            Err(_) => GatewayState::Loading,
            Ok(slot) => match &*slot {
                Slot::Empty => GatewayState::Idle,
                Slot::Ready(_) => GatewayState::Ready,
                Slot::Failed(_) => GatewayState::Failed,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClassifier;

    impl ImageClassifier for StubClassifier {
        fn class_count(&self) -> usize {
            1
        }

        fn classify(&self, _frame: &FrameBuffer) -> Result<Vec<Prediction>, ModelError> {
            Ok(vec![Prediction {
                label: "stub".into(),
                probability: 1.0,
            }])
        }
    }

    /// Counts load calls and fails the first `fail_first` of them.
    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: usize,
    }

    impl CountingLoader {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(&self) -> Result<Box<dyn ImageClassifier>, ModelError> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                Err(ModelError::MissingAsset("model.onnx".into()))
            } else {
                Ok(Box::new(StubClassifier))
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_share_one_load() {
        let loader = CountingLoader::new(0);
        let gateway = Arc::new(ModelGateway::new(Arc::clone(&loader) as Arc<dyn ModelLoader>));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move { gateway.acquire().await.unwrap() })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
    }

    #[tokio::test]
    async fn repeated_acquire_reuses_the_cached_handle() {
        let loader = CountingLoader::new(0);
        let gateway = ModelGateway::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        let first = gateway.acquire().await.unwrap();
        let second = gateway.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.state(), GatewayState::Ready);
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let loader = CountingLoader::new(1);
        let gateway = ModelGateway::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        assert_eq!(gateway.state(), GatewayState::Idle);
        assert!(gateway.acquire().await.is_err());
        assert_eq!(gateway.state(), GatewayState::Failed);

        // The corrected bundle is picked up on the next attempt.
        assert!(gateway.acquire().await.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.state(), GatewayState::Ready);
    }

    #[tokio::test]
    async fn classify_without_loadable_model_returns_empty() {
        let loader = CountingLoader::new(usize::MAX);
        let gateway = ModelGateway::new(loader as Arc<dyn ModelLoader>);

        let mut buffer = FrameBuffer::new();
        buffer.normalize(&image::RgbImage::new(4, 4), Some((4, 4)));

        assert!(gateway.classify(&buffer).await.is_empty());
    }
}
