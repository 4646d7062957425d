pub mod config;
pub mod context;
pub mod run;

use std::path::Path;

use anyhow::Context;
use fm_core::config::Config;
use serde::Serialize;

/// Load the config from `path`, or from `~/.foreman/config.toml` (defaults
/// when that file does not exist).
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
