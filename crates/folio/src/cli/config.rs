//! Config command handlers

use std::path::{Path, PathBuf};

use folio_core::config::Config;
use folio_core::error::FolioError;

use crate::cli::CliResult;
use crate::cli::args::ConfigCommands;

pub fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<PathBuf>,
) -> CliResult {
    let path = config_path
        .or_else(Config::config_path)
        .ok_or(FolioError::NoConfigDir)?;

    match command {
        None | Some(ConfigCommands::Show) => show_config(&path),
        Some(ConfigCommands::Set { key, value }) => set_config(&path, &key, &value),
    }
}

fn load(path: &Path) -> CliResult<Config> {
    if path.exists() {
        Ok(Config::load_from(path)?)
    } else {
        Ok(Config::default())
    }
}

fn show_config(path: &Path) -> CliResult {
    let config = load(path)?;
    println!("Folio Configuration");
    println!("===================");
    println!("Config file: {}", path.display());
    println!(
        "Sync mode: {} (effective: {})",
        config.sync_mode,
        config.effective_sync_mode()
    );
    println!("WebSocket URL: {}", display_opt(config.websocket_url.as_deref()));
    println!("API URL: {}", display_opt(config.api_url.as_deref()));
    println!("Username: {}", display_opt(config.username.as_deref()));
    println!(
        "Session token: {}",
        if config.session_token.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    match config.resolved_data_dir() {
        Ok(dir) => println!("Data directory: {}", dir.display()),
        Err(e) => println!("Data directory: ({})", e),
    }
    Ok(())
}

fn set_config(path: &Path, key: &str, value: &str) -> CliResult {
    let mut config = load(path)?;
    config.set_field(key, value)?;
    config.save_to(path)?;
    if value.is_empty() {
        println!("✓ Cleared {}", key);
    } else if key == "session_token" {
        println!("✓ Updated session_token");
    } else {
        println!("✓ Set {} = {}", key, value);
    }
    Ok(())
}

fn display_opt(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}
