use llama_bridge::engine::llama::{LlamaBackend, LlamaModel, ModelParams};

use crate::cli::InfoArgs;

pub async fn execute(args: InfoArgs) -> anyhow::Result<()> {
    LlamaBackend::init();
    // Metadata only; keep everything on the CPU.
    let model = LlamaModel::load_from_file(&args.model, &ModelParams::with_gpu_layers(0))?;
    let metadata = model.metadata();

    if args.json {
        let meta: serde_json::Map<String, serde_json::Value> = metadata
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        let out = serde_json::json!({
            "description": model.desc(),
            "size": model.size(),
            "n_params": model.n_params(),
            "n_layer": model.n_layer(),
            "n_ctx_train": model.n_ctx_train(),
            "n_vocab": model.n_vocab(),
            "metadata": meta,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", model.desc());
    println!("size:        {}", human_size(model.size()));
    println!("parameters:  {}", model.n_params());
    println!("layers:      {}", model.n_layer());
    println!("train ctx:   {}", model.n_ctx_train());
    println!("vocab:       {}", model.n_vocab());
    println!();
    println!("{:<48} Value", "Key");
    println!("{}", "-".repeat(74));
    for (key, value) in &metadata {
        let value: String = value.chars().take(64).collect();
        println!("{key:<48} {value}");
    }
    println!("\n{} metadata entries.", metadata.len());
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}
