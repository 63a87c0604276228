//! JNI entry points for `com.llamabridge.jni.LlamaInference`.
//!
//! Every native object the host holds is an opaque `long` handle into one of
//! the arenas below. Failures never cross the boundary as exceptions: each
//! call logs the error and returns a sentinel (`0`, `-1`, `null`).
//!
//! Host classes this library expects:
//!
//! - `com.llamabridge.jni.IntVar` with `int value` and `void inc()`
//! - `com.llamabridge.jni.LogManager` with `static void print(String)`
//!   (optional; without it logs go to the native channel only, logcat
//!   on Android)

mod handles;
mod host;

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use anyhow::{Context as _, anyhow};
use jni::objects::{JClass, JObject, JString};
use jni::sys::{JNI_FALSE, JNI_TRUE, JNI_VERSION_1_6, jboolean, jfloat, jint, jlong, jstring};
use jni::{JNIEnv, JavaVM};
use llama_bridge::engine::llama::{
    ContextParams, GgmlBackends, LlamaBackend, LlamaContext, LlamaModel, ModelParams, SamplerChain,
};
use llama_bridge::logging::{self, DEFAULT_FILTER};
use llama_bridge::{
    DecodeBatch, GenerationSession, HostSink, InferenceContext, InferenceRuntime, SamplingParams,
    SessionConfig, StepOutput, select_gpu_layers,
};
use tracing::{debug, error, info, warn};

use crate::handles::HandleArena;
use crate::host::{IntVarCursor, JavaLogSink};

struct ContextEntry {
    ctx: LlamaContext,
    session: Option<GenerationSession<'static>>,
}

static HOST_SINK: LazyLock<HostSink> = LazyLock::new(HostSink::new);
static MODELS: LazyLock<HandleArena<Arc<LlamaModel>>> =
    LazyLock::new(|| HandleArena::new("model"));
static CONTEXTS: LazyLock<HandleArena<Arc<Mutex<ContextEntry>>>> =
    LazyLock::new(|| HandleArena::new("context"));
static BATCHES: LazyLock<HandleArena<Arc<Mutex<DecodeBatch>>>> =
    LazyLock::new(|| HandleArena::new("batch"));
static SAMPLERS: LazyLock<HandleArena<Arc<Mutex<SamplerChain>>>> =
    LazyLock::new(|| HandleArena::new("sampler"));

//  Helpers

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve<T: Clone>(arena: &HandleArena<T>, handle: jlong) -> anyhow::Result<T> {
    arena
        .get(handle)
        .ok_or_else(|| anyhow!("unknown {} handle {handle}", arena.name()))
}

/// Run `body`, turning both errors and panics into `fallback`.
fn guarded<R>(op: &'static str, fallback: R, body: impl FnOnce() -> anyhow::Result<R>) -> R {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            error!(op, "{e:#}");
            fallback
        }
        Err(_) => {
            error!(op, "panic caught at JNI boundary");
            fallback
        }
    }
}

fn new_jstring(env: &mut JNIEnv<'_>, s: &str) -> anyhow::Result<jstring> {
    Ok(env.new_string(s)?.into_raw())
}

//  Library lifecycle

#[unsafe(no_mangle)]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
    logging::init(DEFAULT_FILTER, &HOST_SINK);
    if let Ok(mut env) = vm.get_env() {
        match JavaLogSink::resolve(&mut env) {
            Some(sink) => HOST_SINK.attach(Arc::new(sink)),
            None => warn!("{} not found; host log sink disabled", host::LOG_MANAGER_CLASS),
        }
    }
    JNI_VERSION_1_6
}

#[unsafe(no_mangle)]
pub extern "system" fn JNI_OnUnload(_vm: JavaVM, _reserved: *mut c_void) {
    HOST_SINK.detach();
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_backendInit(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
) {
    guarded("backendInit", (), || {
        LlamaBackend::init();
        Ok(())
    })
}

//  Model

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_loadModel<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    path: JString<'local>,
    gpu_layers: jint,
) -> jlong {
    guarded("loadModel", 0, || {
        let path: String = env.get_string(&path).context("model path")?.into();
        LlamaBackend::init();

        let runtime = InferenceRuntime::global();
        let layers = select_gpu_layers(gpu_layers, runtime, &GgmlBackends);
        let model = LlamaModel::load_from_file(Path::new(&path), &ModelParams::with_gpu_layers(layers))?;
        let handle = MODELS.insert(Arc::new(model));
        debug!(handle, "model registered");
        Ok(handle)
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_freeModel(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    model: jlong,
) {
    guarded("freeModel", (), || {
        // Contexts keep their own reference; the model is freed with the last one.
        MODELS.remove(model);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelSize(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    model: jlong,
) -> jlong {
    guarded("modelSize", -1, || {
        let size = resolve(&MODELS, model)?.size();
        Ok(i64::try_from(size).unwrap_or(i64::MAX))
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelDesc<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
) -> jstring {
    guarded("modelDesc", ptr::null_mut(), || {
        let desc = resolve(&MODELS, model)?.desc();
        new_jstring(&mut env, &desc)
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelMetaCount(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    model: jlong,
) -> jint {
    guarded("modelMetaCount", -1, || Ok(resolve(&MODELS, model)?.meta_count()))
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelMetaKeyByIndex<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
    index: jint,
) -> jstring {
    guarded("modelMetaKeyByIndex", ptr::null_mut(), || {
        match resolve(&MODELS, model)?.meta_key_by_index(index) {
            Some(key) => new_jstring(&mut env, &key),
            None => Ok(ptr::null_mut()),
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelMetaValStr<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
    key: JString<'local>,
) -> jstring {
    guarded("modelMetaValStr", ptr::null_mut(), || {
        let key: String = env.get_string(&key).context("metadata key")?.into();
        match resolve(&MODELS, model)?.meta_val_str(&key) {
            Some(val) => new_jstring(&mut env, &val),
            None => Ok(ptr::null_mut()),
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_modelMetaValStrByIndex<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    model: jlong,
    index: jint,
) -> jstring {
    guarded("modelMetaValStrByIndex", ptr::null_mut(), || {
        match resolve(&MODELS, model)?.meta_val_str_by_index(index) {
            Some(val) => new_jstring(&mut env, &val),
            None => Ok(ptr::null_mut()),
        }
    })
}

//  Context

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_newContext(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    model: jlong,
    n_ctx: jint,
    threads: jint,
    gpu_layers: jint,
) -> jlong {
    guarded("newContext", 0, || {
        let model = resolve(&MODELS, model)?;
        let params = ContextParams::for_host(n_ctx, threads);
        // Offload is fixed when the model is loaded.
        debug!(gpu_layers, "context gpu_layers is advisory");
        let ctx = LlamaContext::new(model, &params)?;
        Ok(CONTEXTS.insert(Arc::new(Mutex::new(ContextEntry { ctx, session: None }))))
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_freeContext(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    ctx: jlong,
) {
    guarded("freeContext", (), || {
        CONTEXTS.remove(ctx);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_kvCacheClear(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    ctx: jlong,
) {
    guarded("kvCacheClear", (), || {
        let entry = resolve(&CONTEXTS, ctx)?;
        let mut entry = lock(&entry);
        entry.ctx.clear_memory();
        entry.session = None;
        Ok(())
    })
}

//  Batch

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_newBatch(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    n_tokens: jint,
    embd: jint,
    n_seq_max: jint,
) -> jlong {
    guarded("newBatch", 0, || {
        let batch = DecodeBatch::new(n_tokens, embd, n_seq_max)?;
        Ok(BATCHES.insert(Arc::new(Mutex::new(batch))))
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_freeBatch(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    batch: jlong,
) {
    guarded("freeBatch", (), || {
        let Some(batch) = BATCHES.remove(batch) else {
            return Ok(());
        };
        // A call still using the batch holds a clone; it drops it normally.
        if let Ok(batch) = Arc::try_unwrap(batch) {
            let freed = batch.into_inner().unwrap_or_else(PoisonError::into_inner).release();
            debug!(freed, "batch released");
        }
        Ok(())
    })
}

//  Sampler

fn register_sampler(params: &SamplingParams) -> anyhow::Result<jlong> {
    let chain = SamplerChain::from_params(params)?;
    Ok(SAMPLERS.insert(Arc::new(Mutex::new(chain))))
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_newSampler(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
) -> jlong {
    guarded("newSampler", 0, || register_sampler(&SamplingParams::greedy()))
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_newSamplerWithParams(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    temperature: jfloat,
    top_p: jfloat,
    top_k: jint,
) -> jlong {
    guarded("newSamplerWithParams", 0, || {
        register_sampler(&SamplingParams {
            greedy: false,
            temperature,
            top_k,
            top_p,
            repeat_penalty: 1.0,
            seed: None,
        })
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_newSamplerWithFullParams(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    temperature: jfloat,
    top_p: jfloat,
    top_k: jint,
    repeat_penalty: jfloat,
) -> jlong {
    guarded("newSamplerWithFullParams", 0, || {
        register_sampler(&SamplingParams {
            greedy: false,
            temperature,
            top_k,
            top_p,
            repeat_penalty,
            seed: None,
        })
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_freeSampler(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    sampler: jlong,
) {
    guarded("freeSampler", (), || {
        SAMPLERS.remove(sampler);
        Ok(())
    })
}

//  Completion

/// Evaluate the prompt and start a session on `ctx`. Returns the prompt
/// token count, or `-1` on failure.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_completionInit<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    ctx: jlong,
    batch: jlong,
    prompt: JString<'local>,
    max_tokens: jint,
    parse_special: jboolean,
) -> jint {
    guarded("completionInit", -1, || {
        let prompt: String = env.get_string(&prompt).context("prompt")?.into();
        let entry = resolve(&CONTEXTS, ctx)?;
        let batch = resolve(&BATCHES, batch)?;
        let mut entry = lock(&entry);
        let mut batch = lock(&batch);

        let config = SessionConfig {
            parse_special: parse_special != JNI_FALSE,
            ..SessionConfig::default()
        };
        let mut session = GenerationSession::new(InferenceRuntime::global(), config);
        entry.session = None;
        let n = session.init(&mut entry.ctx, &mut batch, &prompt, max_tokens)?;
        entry.session = Some(session);
        Ok(jint::try_from(n).unwrap_or(jint::MAX))
    })
}

/// Produce the next piece of text.
///
/// Returns the text, `""` once generation has ended, the truncation notice
/// the first time a length limit is hit, or `null` when no complete
/// character is available yet, the run was cancelled, or the step failed.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_completionLoop<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    ctx: jlong,
    batch: jlong,
    sampler: jlong,
    max_tokens: jint,
    cursor: JObject<'local>,
) -> jstring {
    guarded("completionLoop", ptr::null_mut(), || {
        let entry = resolve(&CONTEXTS, ctx)?;
        let batch = resolve(&BATCHES, batch)?;
        let sampler = resolve(&SAMPLERS, sampler)?;
        let mut entry = lock(&entry);
        let mut batch = lock(&batch);
        let mut sampler = lock(&sampler);

        let ContextEntry { ctx, session } = &mut *entry;
        let session = session
            .as_mut()
            .ok_or_else(|| anyhow!("completionLoop before completionInit"))?;

        let output = {
            let mut cursor = IntVarCursor::new(&mut env, &cursor);
            session.step(ctx, &mut batch, &mut *sampler, max_tokens, &mut cursor)?
        };

        match output {
            StepOutput::Text(text) => new_jstring(&mut env, &text),
            StepOutput::Finished {
                reason,
                notice: Some(notice),
            } => {
                info!(%reason, generated = session.generated_tokens(), "generation finished");
                new_jstring(&mut env, &notice)
            }
            StepOutput::Finished { notice: None, .. } => new_jstring(&mut env, ""),
            StepOutput::Pending | StepOutput::Cancelled => Ok(ptr::null_mut()),
        }
    })
}

//  Process controls

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_setShouldStop(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
    stop: jboolean,
) {
    InferenceRuntime::global().set_should_stop(stop != JNI_FALSE);
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_getShouldStop(
    _env: JNIEnv<'_>,
    _class: JClass<'_>,
) -> jboolean {
    if InferenceRuntime::global().should_stop() {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// `"major.minor"` of the usable Vulkan runtime, or `null`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_llamabridge_jni_LlamaInference_getVulkanVersion<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    guarded("getVulkanVersion", ptr::null_mut(), || {
        match InferenceRuntime::global().probe().vulkan_version() {
            Some(version) => new_jstring(&mut env, &version),
            None => Ok(ptr::null_mut()),
        }
    })
}
