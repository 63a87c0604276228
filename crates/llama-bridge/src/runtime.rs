//! Process-level inference state.
//!
//! Everything that is legitimately shared between sessions lives here: the
//! cached Vulkan probe, the one-shot backend loading guard, the stop flag
//! and the process-scoped truncation notice flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::cancel::CancellationFlag;
use crate::probe::{CapabilityProbe, ProbeConfig, RuntimeProbeResult, VulkanProber};

pub struct InferenceRuntime {
    prober: Box<dyn CapabilityProbe>,
    probe_cache: RwLock<Option<RuntimeProbeResult>>,
    backends: Once,
    cancel: CancellationFlag,
    notice_sent: AtomicBool,
}

impl InferenceRuntime {
    pub fn new(prober: Box<dyn CapabilityProbe>) -> Self {
        Self {
            prober,
            probe_cache: RwLock::new(None),
            backends: Once::new(),
            cancel: CancellationFlag::new(),
            notice_sent: AtomicBool::new(false),
        }
    }

    /// Runtime over the system Vulkan loader.
    pub fn with_config(config: ProbeConfig) -> Self {
        Self::new(Box::new(VulkanProber::system(config)))
    }

    /// The process singleton, created with the default probe policy on
    /// first use.
    pub fn global() -> &'static InferenceRuntime {
        static GLOBAL: OnceLock<InferenceRuntime> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::with_config(ProbeConfig::default()))
    }

    //  Probe cache

    /// Cached probe result; the first caller runs the probe.
    pub fn probe(&self) -> RuntimeProbeResult {
        if let Some(cached) = self
            .probe_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return cached.clone();
        }

        let mut slot = self
            .probe_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = slot.as_ref() {
            return cached.clone();
        }
        let result = self.prober.probe();
        *slot = Some(result.clone());
        result
    }

    /// Drop the cached result so the next [`probe`](Self::probe) re-runs.
    pub fn reset_probe(&self) {
        *self
            .probe_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!("Vulkan probe cache cleared");
    }

    pub fn is_probed(&self) -> bool {
        self.probe_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    //  Backends

    /// Run `load` at most once for the lifetime of this runtime.
    pub(crate) fn load_backends_once(&self, load: impl FnOnce()) {
        self.backends.call_once(load);
    }

    pub fn backends_loaded(&self) -> bool {
        self.backends.is_completed()
    }

    //  Cancellation

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn set_should_stop(&self, stop: bool) {
        debug!(stop, "Setting stop flag");
        self.cancel.set(stop);
    }

    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    //  Truncation notice

    /// Claim the process-scoped truncation notice. Returns `true` for the
    /// first caller only.
    pub(crate) fn claim_notice(&self) -> bool {
        self.notice_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for InferenceRuntime {
    fn default() -> Self {
        Self::with_config(ProbeConfig::default())
    }
}
