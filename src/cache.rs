//! Archive cache management.
//!
//! Built archives live under `~/.sx/cache/<core>/<board>/` and are reused
//! across builds by modification-time comparison.
//!
//! ## Commands
//!
//! - `sx cache path` - Print cache directory location
//! - `sx cache list` - List cached target pairs and their archives
//! - `sx cache clean` - Clear all cached archives

use crate::ui;
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::PathBuf;

/// Default cache root: `~/.sx/cache`.
pub fn default_root() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".sx").join("cache"))
}

/// Default installation root holding the bundle catalogs: `~/.sx`.
pub fn default_install_root() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("SX_HOME") {
        return Ok(PathBuf::from(root));
    }
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".sx"))
}

pub fn print_path() -> Result<()> {
    println!("{}", default_root()?.display());
    Ok(())
}

pub fn list() -> Result<()> {
    let root = default_root()?;
    if !root.exists() {
        println!("{} Cache is empty.", "ℹ".blue());
        return Ok(());
    }

    let mut table = ui::Table::new(&["Core", "Board", "Archives"]);
    for core_entry in fs::read_dir(&root)?.flatten() {
        if !core_entry.path().is_dir() {
            continue;
        }
        let core = core_entry.file_name().to_string_lossy().to_string();
        for board_entry in fs::read_dir(core_entry.path())?.flatten() {
            if !board_entry.path().is_dir() {
                continue;
            }
            let board = board_entry.file_name().to_string_lossy().to_string();
            let archives = fs::read_dir(board_entry.path())?
                .flatten()
                .filter(|e| {
                    e.path()
                        .extension()
                        .map(|x| x == "a")
                        .unwrap_or(false)
                })
                .count();
            table.add_row(vec![core.clone(), board, archives.to_string()]);
        }
    }

    if table.is_empty() {
        println!("{} (empty)", "ℹ".blue());
    } else {
        table.print();
    }
    Ok(())
}

pub fn clean() -> Result<()> {
    let root = default_root()?;
    if root.exists() {
        println!("{} Cleaning cache...", "🧹".yellow());
        fs::remove_dir_all(&root)?;
        fs::create_dir_all(&root)?;
        println!("{} Cache cleaned.", "✓".green());
    } else {
        println!("{} Cache already empty.", "✓".green());
    }
    Ok(())
}
