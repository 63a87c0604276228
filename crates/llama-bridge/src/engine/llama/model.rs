//! Safe RAII wrapper around `llama_model`.

use std::ffi::{CString, c_char};
use std::path::Path;

use tracing::{debug, info};

use crate::engine::Token;
use crate::error::{BridgeError, Result};
use crate::selector::ALL_LAYERS;

/// Layer count llama.cpp treats as "everything".
const OFFLOAD_ALL: i32 = 999;

/// Owns a `llama_model` pointer and frees it on drop.
pub struct LlamaModel {
    ptr: *mut llama_sys::llama_model,
}

// Safety: llama_model is internally read-only after creation.
unsafe impl Send for LlamaModel {}
unsafe impl Sync for LlamaModel {}

/// Call a snprintf-style llama.cpp string getter, growing the buffer once if
/// the first attempt was truncated.
fn read_c_string(mut f: impl FnMut(*mut c_char, usize) -> i32) -> Option<String> {
    let mut buf = vec![0u8; 256];
    let mut len = f(buf.as_mut_ptr() as *mut c_char, buf.len());
    if len < 0 {
        return None;
    }
    if len as usize >= buf.len() {
        buf.resize(len as usize + 1, 0);
        len = f(buf.as_mut_ptr() as *mut c_char, buf.len());
        if len < 0 {
            return None;
        }
    }
    buf.truncate(len as usize);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

impl LlamaModel {
    /// Load a GGUF model from `path`.
    pub fn load_from_file(path: &Path, params: &ModelParams) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| BridgeError::ModelLoadFailed {
            path: path.display().to_string(),
            reason: "Invalid UTF-8 in path".into(),
        })?;
        let c_path = CString::new(path_str).map_err(|_| BridgeError::ModelLoadFailed {
            path: path_str.into(),
            reason: "Path contains null byte".into(),
        })?;

        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = params.effective_gpu_layers();
        raw.use_mmap = params.use_mmap;
        raw.use_mlock = params.use_mlock;

        info!(path = %path.display(), n_gpu_layers = raw.n_gpu_layers, "Loading model…");
        let model = unsafe { llama_sys::llama_model_load_from_file(c_path.as_ptr(), raw) };

        if model.is_null() {
            return Err(BridgeError::ModelLoadFailed {
                path: path_str.into(),
                reason: "llama_model_load_from_file returned null".into(),
            });
        }

        let model = Self { ptr: model };
        let n_layer = model.n_layer();
        let on_gpu = raw.n_gpu_layers.clamp(0, n_layer.max(0));
        info!(
            path = %path.display(),
            total_layers = n_layer,
            gpu_layers = on_gpu,
            cpu_layers = n_layer - on_gpu,
            "Model loaded"
        );
        Ok(model)
    }

    //  Accessors

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_model {
        self.ptr
    }

    /// Vocabulary handle (valid for the lifetime of the model).
    pub fn vocab(&self) -> *const llama_sys::llama_vocab {
        unsafe { llama_sys::llama_model_get_vocab(self.ptr) }
    }

    /// Model size in bytes.
    pub fn size(&self) -> u64 {
        unsafe { llama_sys::llama_model_size(self.ptr) }
    }

    pub fn n_params(&self) -> u64 {
        unsafe { llama_sys::llama_model_n_params(self.ptr) }
    }

    pub fn n_layer(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_layer(self.ptr) }
    }

    pub fn n_ctx_train(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(self.ptr) }
    }

    pub fn desc(&self) -> String {
        read_c_string(|buf, len| unsafe { llama_sys::llama_model_desc(self.ptr, buf, len) })
            .unwrap_or_default()
    }

    //  Metadata

    pub fn meta_count(&self) -> i32 {
        unsafe { llama_sys::llama_model_meta_count(self.ptr) }
    }

    pub fn meta_key_by_index(&self, index: i32) -> Option<String> {
        read_c_string(|buf, len| unsafe {
            llama_sys::llama_model_meta_key_by_index(self.ptr, index, buf, len)
        })
    }

    pub fn meta_val_str(&self, key: &str) -> Option<String> {
        let c_key = CString::new(key).ok()?;
        read_c_string(|buf, len| unsafe {
            llama_sys::llama_model_meta_val_str(self.ptr, c_key.as_ptr(), buf, len)
        })
    }

    pub fn meta_val_str_by_index(&self, index: i32) -> Option<String> {
        read_c_string(|buf, len| unsafe {
            llama_sys::llama_model_meta_val_str_by_index(self.ptr, index, buf, len)
        })
    }

    /// Every metadata entry, in index order.
    pub fn metadata(&self) -> Vec<(String, String)> {
        (0..self.meta_count().max(0))
            .filter_map(|i| Some((self.meta_key_by_index(i)?, self.meta_val_str_by_index(i)?)))
            .collect()
    }

    //  Vocabulary helpers

    pub fn n_vocab(&self) -> i32 {
        unsafe { llama_sys::llama_vocab_n_tokens(self.vocab()) }
    }

    pub fn is_eog(&self, token: Token) -> bool {
        unsafe { llama_sys::llama_vocab_is_eog(self.vocab(), token) }
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama model");
            unsafe { llama_sys::llama_model_free(self.ptr) }
        }
    }
}

//  ModelParams

/// Parameters for [`LlamaModel::load_from_file`].
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Layers to offload to GPU. -1 = all, 0 = CPU only.
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl ModelParams {
    pub fn with_gpu_layers(n_gpu_layers: i32) -> Self {
        Self {
            n_gpu_layers,
            ..Default::default()
        }
    }

    /// Value handed to llama.cpp; the "all" sentinel becomes 999.
    pub fn effective_gpu_layers(&self) -> i32 {
        if self.n_gpu_layers == ALL_LAYERS {
            OFFLOAD_ALL
        } else {
            self.n_gpu_layers
        }
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}
