//! Config command handler.
//!
//! Displays the effective configuration or writes a default config file.

use std::path::Path;

use crate::config::{default_config_path, load_config, render_config, write_default_config};
use crate::error::Result;
use crate::output::{BOLD, GRAY, GREEN, RESET, YELLOW};

/// Show the configuration, or with `init` write the defaults to disk.
///
/// # Arguments
///
/// * `path` - Explicit config file; defaults to ~/.config/cpuwatch/config.toml
/// * `init` - Create the file with default values instead of displaying it
pub fn config_command(path: Option<&Path>, init: bool) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if init {
        write_default_config(&target)?;
        println!(
            "{GREEN}\u{2714} Wrote default config to {}{RESET}",
            target.display()
        );
        return Ok(());
    }

    display_config(&target, path.is_some())
}

fn display_config(target: &Path, explicit: bool) -> Result<()> {
    println!("{BOLD}# cpuwatch config{RESET}");
    println!("{GRAY}# {}{RESET}", target.display());
    println!();

    if !explicit && !target.exists() {
        println!("{YELLOW}# (file does not exist, using defaults){RESET}");
        println!();
    }

    let config = load_config(explicit.then_some(target))?;
    print!("{}", render_config(&config)?);
    Ok(())
}
