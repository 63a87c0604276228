//! Global llama.cpp backend initialization and the ggml backend registry.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Once;

use tracing::{debug, info};

use crate::selector::{BackendDevice, BackendRegistry, DeviceKind};

static BACKEND_INIT: Once = Once::new();

/// Handle proving the llama.cpp backend is initialized.
///
/// The first call to [`LlamaBackend::init`] initializes the C backend and
/// routes llama.cpp's own log output into `tracing`; later calls are no-ops.
/// The backend lives until process exit.
#[derive(Debug, Clone, Copy)]
pub struct LlamaBackend {
    _private: (),
}

impl LlamaBackend {
    pub fn init() -> Self {
        BACKEND_INIT.call_once(|| {
            unsafe {
                llama_sys::llama_backend_init();
                llama_sys::llama_log_set(Some(log_callback), std::ptr::null_mut());
            }
            info!("llama.cpp backend initialized");
        });
        Self { _private: () }
    }

    pub fn system_info() -> String {
        unsafe {
            CStr::from_ptr(llama_sys::llama_print_system_info())
                .to_string_lossy()
                .into_owned()
        }
    }
}

unsafe extern "C" fn log_callback(
    level: llama_sys::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    let msg = msg.trim();
    if msg.is_empty() {
        return;
    }
    // ggml_log_level: DEBUG=1, INFO=2, WARN=3, ERROR=4, CONT=5
    match level {
        4 => tracing::error!(target: "llama.cpp", "{msg}"),
        3 => tracing::warn!(target: "llama.cpp", "{msg}"),
        2 => tracing::info!(target: "llama.cpp", "{msg}"),
        _ => tracing::debug!(target: "llama.cpp", "{msg}"),
    }
}

/// ggml's dynamic backend registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct GgmlBackends;

impl BackendRegistry for GgmlBackends {
    fn load_all(&self) {
        unsafe { llama_sys::ggml_backend_load_all() };
        debug!("ggml_backend_load_all() done");
    }

    fn devices(&self) -> Vec<BackendDevice> {
        let count = unsafe { llama_sys::ggml_backend_dev_count() };
        (0..count)
            .filter_map(|i| {
                let dev = unsafe { llama_sys::ggml_backend_dev_get(i) };
                if dev.is_null() {
                    return None;
                }
                let name = unsafe { llama_sys::ggml_backend_dev_name(dev) };
                let name = if name.is_null() {
                    String::from("unknown")
                } else {
                    unsafe { CStr::from_ptr(name) }
                        .to_string_lossy()
                        .into_owned()
                };
                // ggml_backend_dev_type: CPU=0, GPU=1, IGPU=2, ACCEL=3
                let kind = match unsafe { llama_sys::ggml_backend_dev_type(dev) } {
                    0 => DeviceKind::Cpu,
                    1 => DeviceKind::Gpu,
                    2 => DeviceKind::IntegratedGpu,
                    3 => DeviceKind::Accelerator,
                    _ => DeviceKind::Unknown,
                };
                Some(BackendDevice { name, kind })
            })
            .collect()
    }
}
