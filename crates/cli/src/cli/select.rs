use llama_bridge::{BackendRegistry, InferenceRuntime, select_gpu_layers};

use crate::cli::{SelectArgs, probe_config};
use crate::config::CliConfig;

/// Registry used when the binary is built without llama.cpp: nothing to
/// load, no devices to list.
#[cfg(not(feature = "llama-cpp"))]
pub struct NoBackends;

#[cfg(not(feature = "llama-cpp"))]
impl BackendRegistry for NoBackends {
    fn load_all(&self) {}

    fn devices(&self) -> Vec<llama_bridge::BackendDevice> {
        Vec::new()
    }
}

pub fn registry() -> &'static dyn BackendRegistry {
    #[cfg(feature = "llama-cpp")]
    {
        &llama_bridge::engine::llama::GgmlBackends
    }
    #[cfg(not(feature = "llama-cpp"))]
    {
        &NoBackends
    }
}

pub async fn execute(args: SelectArgs) -> anyhow::Result<()> {
    let cfg = CliConfig::load_or_default()?;
    let probe = probe_config(&cfg.probe, args.min_version.as_deref())?;
    let requested = args.gpu_layers.unwrap_or(cfg.gpu_layers);

    let runtime = InferenceRuntime::with_config(probe);
    let effective = select_gpu_layers(requested, &runtime, registry());

    println!("requested: {requested}");
    println!("effective: {effective}");
    if requested != 0 && effective == 0 {
        println!("(Vulkan runtime not suitable; running on CPU)");
    }
    Ok(())
}
