use std::io::{self, Write};
use std::sync::Arc;

use llama_bridge::engine::llama::{
    ContextParams, GgmlBackends, LlamaBackend, LlamaContext, LlamaModel, ModelParams, SamplerChain,
};
use llama_bridge::{
    GenerateEvent, GenerateRequest, InferenceRuntime, SamplingParams, generate_blocking,
    select_gpu_layers,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::CliConfig;

fn sampling_params(args: &RunArgs, base: &SamplingParams) -> SamplingParams {
    SamplingParams {
        greedy: args.greedy || base.greedy,
        temperature: args.temp.unwrap_or(base.temperature),
        top_k: args.top_k.unwrap_or(base.top_k),
        top_p: args.top_p.unwrap_or(base.top_p),
        repeat_penalty: args.repeat_penalty.unwrap_or(base.repeat_penalty),
        seed: base.seed,
    }
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let cfg = CliConfig::load_or_default()?;
    LlamaBackend::init();

    let runtime = Arc::new(InferenceRuntime::with_config(cfg.probe.clone()));
    let layers = select_gpu_layers(args.gpu_layers.unwrap_or(cfg.gpu_layers), &runtime, &GgmlBackends);

    info!(model = %args.model.display(), gpu_layers = layers, "Loading model");
    let model = Arc::new(LlamaModel::load_from_file(
        &args.model,
        &ModelParams::with_gpu_layers(layers),
    )?);

    let threads = args.threads.or(cfg.threads).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4)
    });
    let ctx_params = ContextParams::for_host(args.ctx_size.unwrap_or(cfg.ctx_size), threads);
    let mut ctx = LlamaContext::new(model, &ctx_params)?;
    let mut sampler = SamplerChain::from_params(&sampling_params(&args, &cfg.sampling))?;

    let request = GenerateRequest {
        prompt: args.prompt.clone(),
        max_tokens: args.max_tokens.unwrap_or(cfg.max_tokens),
        session: cfg.session.clone(),
    };

    let cancel = runtime.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping generation");
            cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let worker = tokio::task::spawn_blocking(move || {
        generate_blocking(&runtime, &mut ctx, &mut sampler, &request, tx);
    });

    let mut stdout = io::stdout();
    let mut failed = None;
    while let Some(event) = rx.recv().await {
        match event {
            GenerateEvent::Token(piece) => {
                print!("{piece}");
                stdout.flush()?;
            }
            GenerateEvent::Done {
                finish_reason,
                prompt_tokens,
                completion_tokens,
            } => {
                println!();
                eprintln!(
                    "  [{finish_reason} | prompt: {prompt_tokens} tok, gen: {completion_tokens} tok]"
                );
            }
            GenerateEvent::Error(e) => failed = Some(e),
        }
    }
    worker.await?;

    match failed {
        Some(e) => anyhow::bail!("generation failed: {e}"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn flags_override_config_sampling() {
        let args = run_args(&["llama-bridge", "run", "m.gguf", "-p", "hi", "--temp", "0.2"]);
        let base = SamplingParams::default();
        let params = sampling_params(&args, &base);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_k, base.top_k);
        assert!(!params.greedy);
    }

    #[test]
    fn greedy_flag_wins() {
        let args = run_args(&["llama-bridge", "run", "m.gguf", "-p", "hi", "--greedy"]);
        assert!(sampling_params(&args, &SamplingParams::default()).greedy);
    }
}
