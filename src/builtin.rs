//! In-process builtin commands.
//!
//! A script line resolving to `__builtin_<name>::arg1::arg2` runs inside
//! the engine process instead of spawning anything. The registry is an
//! explicit name-to-handler map built once at startup; hosts extend it
//! with their own commands (port locking, remote shells) before handing
//! it to the interpreter. Unknown names report and fail rather than
//! falling through to the process runner.

use crate::context::Context;
use anyhow::Result;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

pub trait BuiltinCommand {
    fn run(&self, ctx: &mut Context, args: &[String]) -> Result<bool>;
}

#[derive(Default)]
pub struct BuiltinRegistry {
    commands: HashMap<String, Box<dyn BuiltinCommand>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock commands.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Box::new(Echo));
        registry.register("delay", Box::new(Delay));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, command: Box<dyn BuiltinCommand>) {
        self.commands.insert(name.into(), command);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn run(&self, ctx: &mut Context, name: &str, args: &[String]) -> Result<bool> {
        match self.commands.get(name) {
            Some(command) => command.run(ctx, args),
            None => {
                ctx.error(&format!("Unknown builtin command '{}'", name));
                Ok(false)
            }
        }
    }
}

/// Print the arguments to the message sink.
struct Echo;

impl BuiltinCommand for Echo {
    fn run(&self, ctx: &mut Context, args: &[String]) -> Result<bool> {
        ctx.message(&args.join(" "));
        Ok(true)
    }
}

/// Pause the script for the given number of milliseconds.
struct Delay;

impl BuiltinCommand for Delay {
    fn run(&self, ctx: &mut Context, args: &[String]) -> Result<bool> {
        let Some(ms) = args.first().and_then(|a| a.parse::<u64>().ok()) else {
            ctx.error("delay requires a millisecond count");
            return Ok(false);
        };
        thread::sleep(Duration::from_millis(ms));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::RecordingReporter;

    fn test_context() -> Context {
        Context::new(
            Box::new(RecordingReporter::default()),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_unknown_builtin_reports_and_fails() {
        let registry = BuiltinRegistry::with_defaults();
        let mut ctx = test_context();
        assert!(!registry.run(&mut ctx, "no_such", &[]).unwrap());
    }

    #[test]
    fn test_echo_succeeds() {
        let registry = BuiltinRegistry::with_defaults();
        let mut ctx = test_context();
        assert!(registry
            .run(&mut ctx, "echo", &["hi".to_string(), "there".to_string()])
            .unwrap());
    }

    #[test]
    fn test_delay_rejects_missing_count() {
        let registry = BuiltinRegistry::with_defaults();
        let mut ctx = test_context();
        assert!(!registry.run(&mut ctx, "delay", &[]).unwrap());
    }
}
