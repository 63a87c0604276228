use llama_bridge::{InferenceRuntime, RuntimeProbeResult};

use crate::cli::{ProbeArgs, probe_config};
use crate::config::CliConfig;

pub async fn execute(args: ProbeArgs) -> anyhow::Result<()> {
    let cfg = CliConfig::load_or_default()?;
    let probe = probe_config(&cfg.probe, args.min_version.as_deref())?;
    let floor = probe.min_api_version;

    let runtime = InferenceRuntime::with_config(probe);
    let result = runtime.probe();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render(&result, &floor.to_string()));
    }
    Ok(())
}

fn render(r: &RuntimeProbeResult, floor: &str) -> String {
    let yn = |b: bool| if b { "yes" } else { "no" };
    let mut out = String::new();
    let mut row = |k: &str, v: &str| out.push_str(&format!("{k:<24} {v}\n"));
    row("Library available", yn(r.library_available));
    row("Instance creation", yn(r.instance_creation_works));
    row("Physical devices", yn(r.physical_devices_available));
    row("Device count", &r.device_count.to_string());
    if let Some(name) = &r.device_name {
        row("First device", name);
    }
    row("Extended features", yn(r.extended_features_available));
    row("API version", &r.api_version.to_string());
    row(&format!("Meets minimum ({floor})"), yn(r.meets_minimum_version));
    row("Suitable for GPU", yn(r.suitable));
    row(
        "Vulkan version",
        r.vulkan_version().as_deref().unwrap_or("-"),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_runtime_renders_as_cpu_only() {
        let text = render(&RuntimeProbeResult::default(), "1.2");
        assert!(text.contains("Library available        no"));
        assert!(text.contains("Meets minimum (1.2)      no"));
        assert!(text.contains("Suitable for GPU         no"));
        assert!(text.contains("Vulkan version           -"));
        assert!(!text.contains("First device"));
    }
}
