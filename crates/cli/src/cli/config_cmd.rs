use crate::cli::{ConfigAction, ConfigArgs};
use crate::config::CliConfig;

pub async fn execute(args: ConfigArgs) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            let cfg = CliConfig::load_or_default()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = CliConfig::load_or_default()?;
            cfg.set(&key, &value)?;
            cfg.save()?;
            println!("Configuration updated.");
        }
        ConfigAction::Path => println!("{}", CliConfig::config_file().display()),
    }
    Ok(())
}
