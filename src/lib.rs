//! # saxe - Embedded Firmware Build Engine
//!
//! saxe (pronounced "s-axe") is the build orchestrator behind the `sx`
//! tool: point it at a sketch and a target and it turns layered
//! configuration into firmware.
//!
//! ## Features
//!
//! - **Layered Configuration**: compiler, core, board and programmer
//!   bundles merge into one effective view per build
//! - **Recipe Templating**: `${...}` placeholders with conditionals,
//!   iteration and file search
//! - **Scripted Commands**: configuration-driven control flow
//!   (`goto::`/`set::`/`fail`/`end`) without a scripting language
//! - **Transitive Libraries**: include scanning with scoped resolution
//! - **Incremental Builds**: mtime-based skip at file and archive level
//!
//! ## Quick Start
//!
//! ```bash
//! # Build the sketch in the current directory
//! sx build
//!
//! # Build and flash
//! sx upload -p /dev/ttyUSB0
//! ```
//!
//! ## Module Organization
//!
//! - [`props`] - Layered property stores and the definition-file grammar
//! - [`expand`] - Recipe token expansion
//! - [`script`] - The scripted-command interpreter
//! - [`exec`] - Process running and output demultiplexing
//! - [`build`] - The staged compile/archive/link pipeline

/// Staged build pipeline with incremental rebuilds.
pub mod build;

/// In-process builtin commands and their registry.
pub mod builtin;

/// Archive cache management (`sx cache`).
pub mod cache;

/// Installed board/core/compiler/programmer bundles.
pub mod catalog;

/// Project manifest parsing (`sx.toml`).
pub mod config;

/// Per-build context: layers, sinks, process registry.
pub mod context;

/// Process execution and stream demultiplexing.
pub mod exec;

/// Recipe token expansion.
pub mod expand;

/// Library discovery and dependency resolution.
pub mod libs;

/// Layered property stores.
pub mod props;

/// The scripted-command interpreter.
pub mod script;

/// The sketch model and source preparation.
pub mod sketch;

/// Terminal UI (console reporter, tables).
pub mod ui;

/// Recipe-driven firmware upload.
pub mod upload;

/// Rebuild-on-change watcher.
pub mod watch;
