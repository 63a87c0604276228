//! CPU/GPU decision for model loading.

use tracing::{debug, info, warn};

use crate::runtime::InferenceRuntime;

/// "Offload every layer" request value.
pub const ALL_LAYERS: i32 = -1;

/// A compute device reported by the backend registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDevice {
    pub name: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    IntegratedGpu,
    Accelerator,
    Unknown,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::IntegratedGpu => "IGPU",
            Self::Accelerator => "ACCEL",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Optional compute backend modules (ggml's dynamic backend registry).
pub trait BackendRegistry {
    /// Load every optional backend module available to the process.
    fn load_all(&self);

    fn devices(&self) -> Vec<BackendDevice>;
}

/// Effective GPU-layer count for a load request.
///
/// `0` never touches the probe. Any other value is returned unchanged when
/// the runtime probe says Vulkan is usable, and becomes `0` otherwise.
pub fn select_gpu_layers(
    requested: i32,
    runtime: &InferenceRuntime,
    registry: &dyn BackendRegistry,
) -> i32 {
    if requested == 0 {
        debug!("CPU-only requested; skipping Vulkan probe");
        return 0;
    }

    let probe = runtime.probe();
    if !probe.suitable {
        info!(
            requested,
            "Vulkan runtime not suitable; falling back to CPU (0 GPU layers)"
        );
        return 0;
    }

    runtime.load_backends_once(|| {
        info!("Loading ggml compute backends");
        registry.load_all();
        log_devices(&registry.devices());
    });

    info!(requested, "Vulkan runtime suitable; using GPU layers");
    requested
}

fn log_devices(devices: &[BackendDevice]) {
    info!(count = devices.len(), "Available compute devices");
    for (i, dev) in devices.iter().enumerate() {
        info!(index = i, name = %dev.name, kind = %dev.kind, "  device");
    }
    let has_vulkan = devices
        .iter()
        .any(|d| d.name.to_ascii_lowercase().contains("vulkan"));
    if has_vulkan {
        info!("Vulkan device present: yes");
    } else {
        warn!("Vulkan device present: no");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::probe::{CapabilityProbe, RuntimeProbeResult};

    struct StaticProbe {
        suitable: bool,
        calls: Arc<AtomicUsize>,
    }

    impl CapabilityProbe for StaticProbe {
        fn probe(&self) -> RuntimeProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RuntimeProbeResult {
                suitable: self.suitable,
                ..Default::default()
            }
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        loads: Cell<usize>,
        enumerations: Cell<usize>,
    }

    impl BackendRegistry for FakeRegistry {
        fn load_all(&self) {
            self.loads.set(self.loads.get() + 1);
        }

        fn devices(&self) -> Vec<BackendDevice> {
            self.enumerations.set(self.enumerations.get() + 1);
            vec![
                BackendDevice {
                    name: "CPU".into(),
                    kind: DeviceKind::Cpu,
                },
                BackendDevice {
                    name: "Vulkan0".into(),
                    kind: DeviceKind::Gpu,
                },
            ]
        }
    }

    fn runtime(suitable: bool) -> (InferenceRuntime, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = InferenceRuntime::new(Box::new(StaticProbe {
            suitable,
            calls: calls.clone(),
        }));
        (rt, calls)
    }

    #[test]
    fn zero_layers_skips_probe_and_backends() {
        let (rt, calls) = runtime(true);
        let reg = FakeRegistry::default();
        assert_eq!(select_gpu_layers(0, &rt, &reg), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(reg.loads.get(), 0);
        assert!(!rt.backends_loaded());
    }

    #[test]
    fn suitable_keeps_request_including_all_sentinel() {
        let (rt, _) = runtime(true);
        let reg = FakeRegistry::default();
        assert_eq!(select_gpu_layers(ALL_LAYERS, &rt, &reg), ALL_LAYERS);
        assert_eq!(select_gpu_layers(20, &rt, &reg), 20);
    }

    #[test]
    fn unsuitable_falls_back_to_cpu() {
        let (rt, _) = runtime(false);
        let reg = FakeRegistry::default();
        assert_eq!(select_gpu_layers(ALL_LAYERS, &rt, &reg), 0);
        assert_eq!(reg.loads.get(), 0);
    }

    #[test]
    fn backends_load_once_across_sessions() {
        let (rt, calls) = runtime(true);
        let reg = FakeRegistry::default();
        for _ in 0..4 {
            select_gpu_layers(ALL_LAYERS, &rt, &reg);
        }
        assert_eq!(reg.loads.get(), 1);
        assert_eq!(reg.enumerations.get(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "probe should be cached");
    }
}
