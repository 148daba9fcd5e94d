//! Config command implementations
//!
//! Operate on the client's TOML file directly so unknown keys survive a
//! `set`. Keys are dotted paths into the TOML table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use pt_core::config::{self, ClientConfig};

/// Client config file name inside the config directory
pub const CLIENT_CONFIG_FILE: &str = "client.toml";

fn resolve(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::default_config_path(CLIENT_CONFIG_FILE))
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| "Failed to parse config file")
}

/// Get a config value by key
pub fn config_get(config_path: Option<&Path>, key: &str) -> Result<()> {
    let path = resolve(config_path);
    if !path.exists() {
        print_error(&format!("Config file not found: {:?}", path));
        print_info("Run 'peerterm config init' to create one");
        return Ok(());
    }

    let mut current = toml::Value::Table(read_table(&path)?);
    for part in key.split('.') {
        let next = match &current {
            toml::Value::Table(table) => table.get(part).cloned(),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => {
                print_error(&format!("Key not found: {}", key));
                return Ok(());
            }
        }
    }

    match &current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(&current)?),
        other => println!("{}", other),
    }
    Ok(())
}

/// Parse a command-line value into the most specific TOML type
fn parse_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    }
}

/// Set a config value by key
pub fn config_set(config_path: Option<&Path>, key: &str, value: &str) -> Result<()> {
    let path = resolve(config_path);
    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(Some(&path), false)?;
    }

    let mut table = read_table(&path)?;
    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .filter(|(last, _)| !last.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid key: {:?}", key))?;

    let mut current = &mut table;
    for part in parents {
        current = current
            .entry(part.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("Cannot navigate to key: {}", key))?;
    }
    current.insert(last.to_string(), parse_value(value));

    // Reject edits that no longer deserialize
    let content = toml::to_string_pretty(&table)?;
    toml::from_str::<ClientConfig>(&content)
        .map_err(anyhow::Error::from)
        .and_then(|config| config.validate().map_err(anyhow::Error::from))
        .with_context(|| format!("{} = {} is not a valid setting", key, value))?;

    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Show current configuration
pub fn config_show(config_path: Option<&Path>) -> Result<()> {
    let path = resolve(config_path);
    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'peerterm config init' to create one");
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);
    Ok(())
}

/// Write the default configuration
pub fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = resolve(config_path);
    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    config::save_config(&path, &ClientConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}
