//! GPU/CPU backend selection. The GPU is initialized lazily on first use,
//! its readiness is cached, and repeated failures demote it for the rest
//! of the session.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use lumen_core::{BackendError, BackendProvider, ComputeBackend, RenderError};

enum GpuSlot {
    Untried,
    Ready(Arc<dyn ComputeBackend>),
    Unavailable(String),
}

struct Inner {
    gpu: GpuSlot,
    failures: u32,
}

pub struct BackendSelector {
    cpu: Arc<dyn ComputeBackend>,
    provider: Option<Arc<dyn BackendProvider>>,
    failure_limit: u32,
    inner: Mutex<Inner>,
}

impl BackendSelector {
    pub fn new(
        cpu: Arc<dyn ComputeBackend>,
        provider: Option<Arc<dyn BackendProvider>>,
        failure_limit: u32,
    ) -> Self {
        let gpu = match provider {
            Some(_) => GpuSlot::Untried,
            None => GpuSlot::Unavailable("no GPU provider configured".into()),
        };
        Self {
            cpu,
            provider,
            failure_limit: failure_limit.max(1),
            inner: Mutex::new(Inner { gpu, failures: 0 }),
        }
    }

    pub fn cpu(&self) -> &Arc<dyn ComputeBackend> {
        &self.cpu
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The GPU backend, initializing it on first call.
    pub fn gpu(&self) -> Result<Arc<dyn ComputeBackend>, RenderError> {
        let mut inner = self.lock();
        match &inner.gpu {
            GpuSlot::Ready(backend) => return Ok(backend.clone()),
            GpuSlot::Unavailable(reason) => {
                return Err(RenderError::BackendUnavailable(reason.clone()));
            }
            GpuSlot::Untried => {}
        }
        let Some(provider) = &self.provider else {
            return Err(RenderError::BackendUnavailable("no GPU provider configured".into()));
        };
        match provider.init() {
            Ok(backend) => {
                info!(backend = backend.name(), "GPU backend ready");
                inner.gpu = GpuSlot::Ready(backend.clone());
                Ok(backend)
            }
            Err(e) => {
                warn!(error = %e, "GPU backend unavailable, using CPU");
                let reason = e.to_string();
                inner.gpu = GpuSlot::Unavailable(reason.clone());
                Err(RenderError::BackendUnavailable(reason))
            }
        }
    }

    pub fn is_gpu_ready(&self) -> bool {
        matches!(self.lock().gpu, GpuSlot::Ready(_))
    }

    pub fn record_success(&self) {
        self.lock().failures = 0;
    }

    /// Count a failed GPU render. Returns true when this demoted the GPU.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.failures += 1;
        if inner.failures >= self.failure_limit && matches!(inner.gpu, GpuSlot::Ready(_)) {
            warn!(failures = inner.failures, "GPU backend demoted for this session");
            inner.gpu = GpuSlot::Unavailable(format!(
                "{} consecutive GPU failures",
                inner.failures
            ));
            return true;
        }
        false
    }

    /// Run `f` on the GPU backend. Execution failures count towards
    /// demotion; `Unsupported` and invalid input do not, since the device
    /// itself is fine.
    pub fn try_gpu<T>(
        &self,
        f: impl FnOnce(&dyn ComputeBackend) -> Result<T, RenderError>,
    ) -> Result<T, RenderError> {
        let gpu = self.gpu()?;
        let result = f(gpu.as_ref());
        match &result {
            Ok(_) => self.record_success(),
            Err(RenderError::StageFailed {
                source: BackendError::Failed { .. } | BackendError::Unavailable(_),
                ..
            }) => {
                self.record_failure();
            }
            Err(_) => {}
        }
        result
    }
}
