//! Init command - write a default cinder.toml

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;

use crate::config::{CONFIG_FILE, DEFAULT_CONFIG};
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project directory (default: current)
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite an existing cinder.toml
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: InitArgs, format: OutputFormat, quiet: bool) -> Result<()> {
    fs::create_dir_all(&args.path)
        .with_context(|| format!("Could not create {}", args.path.display()))?;
    let project_path = args.path.canonicalize().unwrap_or(args.path.clone());
    let config_path = project_path.join(CONFIG_FILE);

    let created = if config_path.exists() && !args.force {
        false
    } else {
        fs::write(&config_path, DEFAULT_CONFIG)
            .with_context(|| format!("Could not write {}", config_path.display()))?;
        true
    };

    match format {
        OutputFormat::Text => {
            if !quiet {
                if created {
                    println!("  Created {}", config_path.display());
                } else {
                    println!("  Skipped {} (already exists)", config_path.display());
                }
            }
        }
        OutputFormat::Json => {
            let result = serde_json::json!({
                "success": true,
                "created": created,
                "path": config_path.to_string_lossy(),
            });
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    Ok(())
}
