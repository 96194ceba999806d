//! Rebuild on change.
//!
//! `sx watch` poll-watches the sketch folder and reruns the build when a
//! source changes. Events under the build folder are ignored so the
//! build's own output never retriggers it.

use anyhow::Result;
use colored::*;
use notify::{Config, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::channel;
use std::time::Duration;

pub fn watch(folder: &Path, build_folder: &Path, mut rebuild: impl FnMut() -> Result<()>) -> Result<()> {
    println!("{} Watching for changes in {}...", "👀".cyan(), folder.display());

    let (tx, rx) = channel();
    let config = Config::default().with_poll_interval(Duration::from_secs(1));
    let mut watcher = notify::RecommendedWatcher::new(tx, config)?;
    watcher.watch(folder, RecursiveMode::Recursive)?;

    run_and_report(&mut rebuild);

    while let Ok(event) = rx.recv() {
        // Let the burst settle, then drain it.
        std::thread::sleep(Duration::from_millis(100));
        let mut relevant = is_source_event(&event, build_folder);
        while let Ok(event) = rx.try_recv() {
            relevant = relevant || is_source_event(&event, build_folder);
        }
        if !relevant {
            continue;
        }
        println!("{} File changed. Rebuilding...", "🔄".yellow());
        run_and_report(&mut rebuild);
    }
    Ok(())
}

fn is_source_event(event: &notify::Result<notify::Event>, build_folder: &Path) -> bool {
    match event {
        Ok(event) => event
            .paths
            .iter()
            .any(|p| !p.starts_with(build_folder)),
        Err(_) => false,
    }
}

fn run_and_report(rebuild: &mut impl FnMut() -> Result<()>) {
    if let Err(e) = rebuild() {
        println!("{} Error: {}", "x".red(), e);
    }
}
