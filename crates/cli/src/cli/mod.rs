pub mod config_cmd;
#[cfg(feature = "llama-cpp")]
pub mod info;
pub mod probe;
#[cfg(feature = "llama-cpp")]
pub mod run;
pub mod select;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "llama-bridge",
    version,
    about = "Vulkan-aware llama.cpp host: probe the GPU runtime and run completions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect whether the Vulkan runtime is usable for GPU offload.
    Probe(ProbeArgs),

    /// Show the GPU-layer count that would actually be used.
    Select(SelectArgs),

    /// Load a model and stream a completion to stdout.
    #[cfg(feature = "llama-cpp")]
    Run(RunArgs),

    /// Show a model's description, size and metadata.
    #[cfg(feature = "llama-cpp")]
    Info(InfoArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct ProbeArgs {
    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,

    /// Minimum Vulkan version, e.g. `1.2` (overrides config).
    #[arg(long, env = "LLAMA_BRIDGE_MIN_VULKAN")]
    pub min_version: Option<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct SelectArgs {
    /// Requested GPU layers (-1 = all, 0 = CPU only; overrides config).
    #[arg(long, allow_hyphen_values = true)]
    pub gpu_layers: Option<i32>,

    /// Minimum Vulkan version, e.g. `1.2` (overrides config).
    #[arg(long, env = "LLAMA_BRIDGE_MIN_VULKAN")]
    pub min_version: Option<String>,
}

#[cfg(feature = "llama-cpp")]
#[derive(Debug, clap::Args, Clone)]
pub struct RunArgs {
    /// Path to a GGUF model file.
    pub model: std::path::PathBuf,

    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Output positions reserved in the context.
    #[arg(long)]
    pub max_tokens: Option<i32>,

    /// Context size (clamped to 512..=32768).
    #[arg(long)]
    pub ctx_size: Option<i32>,

    /// GPU layers (-1 = all, 0 = CPU only).
    #[arg(long, allow_hyphen_values = true, env = "LLAMA_BRIDGE_GPU_LAYERS")]
    pub gpu_layers: Option<i32>,

    /// Threads.
    #[arg(long, env = "LLAMA_BRIDGE_THREADS")]
    pub threads: Option<i32>,

    /// Temperature.
    #[arg(long)]
    pub temp: Option<f32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub top_k: Option<i32>,

    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    /// Always pick the most likely token.
    #[arg(long)]
    pub greedy: bool,
}

#[cfg(feature = "llama-cpp")]
#[derive(Debug, clap::Args, Clone)]
pub struct InfoArgs {
    /// Path to a GGUF model file.
    pub model: std::path::PathBuf,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
    /// Print the config file location.
    Path,
}

/// Config-file probe policy with an optional `X.Y` override.
pub fn probe_config(
    base: &llama_bridge::ProbeConfig,
    min_version: Option<&str>,
) -> anyhow::Result<llama_bridge::ProbeConfig> {
    let mut config = base.clone();
    if let Some(v) = min_version {
        config.min_api_version = v.parse().map_err(anyhow::Error::msg)?;
    }
    Ok(config)
}
