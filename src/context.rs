//! Per-build context.
//!
//! A [`Context`] owns everything one build needs: the four selected target
//! bundles, the layered settings stores, the output sinks, and the shared
//! process registry. The effective configuration is always computed fresh
//! by [`Context::merged`] so a `set::` from a running script is visible to
//! the very next line.
//!
//! One context serves at most one build at a time; the ephemeral settings
//! layer is not safe for concurrent writers.

use crate::catalog::TargetBundle;
use crate::exec::ProcessRegistry;
use crate::props::PropertyStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Output callbacks implemented by whatever is driving the build (the CLI
/// console here, an editor pane elsewhere). The engine calls these at
/// well-defined points and never depends on what they do.
pub trait Reporter {
    fn message(&self, text: &str);
    fn warning(&self, text: &str);
    fn error(&self, text: &str);
    fn heading(&self, text: &str);
    fn bullet(&self, text: &str);
    fn bullet2(&self, text: &str) {
        self.bullet(text);
    }
    fn bullet3(&self, text: &str) {
        self.bullet(text);
    }
    /// Echo of an about-to-run command. Shown only in verbose mode.
    fn command(&self, text: &str);
    fn progress(&self, percent: u8);
    /// Live echo of raw (non-text) subprocess output.
    fn raw_output(&self, _text: &str) {}
    fn raw_error(&self, _text: &str) {}
}

/// Rewrites or annotates one subprocess output line before delivery.
/// Installed by tooling that wants to spot compiler diagnostics.
pub trait LineParser {
    fn rewrite(&self, line: &str) -> String;
}

pub struct Context {
    pub board: Option<TargetBundle>,
    pub core: Option<TargetBundle>,
    pub compiler: Option<TargetBundle>,
    pub programmer: Option<TargetBundle>,

    /// Project-local persistent settings.
    pub sketch_settings: PropertyStore,
    /// Parameters extracted from `#pragma parameter` lines.
    pub parameters: PropertyStore,
    /// Ephemeral per-build scratch: object paths, include lists, flags.
    settings: PropertyStore,

    reporter: Box<dyn Reporter>,
    pub parser: Option<Box<dyn LineParser>>,
    capture: Option<String>,
    capture_errors: bool,

    pub registry: Arc<ProcessRegistry>,
    abort: Arc<AtomicBool>,

    /// Root under which per-(core, board) archive caches live.
    pub cache_root: PathBuf,
    pub port: Option<String>,
    pub verbose: bool,
    /// Suppresses command echo entirely, independent of `verbose`.
    pub silence: bool,
}

impl Context {
    pub fn new(reporter: Box<dyn Reporter>, cache_root: PathBuf) -> Self {
        Self {
            board: None,
            core: None,
            compiler: None,
            programmer: None,
            sketch_settings: PropertyStore::new(),
            parameters: PropertyStore::new(),
            settings: PropertyStore::new(),
            reporter,
            parser: None,
            capture: None,
            capture_errors: false,
            registry: Arc::new(ProcessRegistry::new()),
            abort: Arc::new(AtomicBool::new(false)),
            cache_root,
            port: None,
            verbose: false,
            silence: false,
        }
    }

    // The ephemeral settings layer.

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.set(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key)
    }

    pub fn clear_settings(&mut self) {
        self.settings = PropertyStore::new();
    }

    /// Merge all the property layers together, in fixed precedence order.
    /// Recomputed on every call; mutations to any layer are immediately
    /// visible in the next merge.
    pub fn merged(&self) -> PropertyStore {
        let mut merged = PropertyStore::new();
        if let Some(programmer) = &self.programmer {
            merged.merge(&programmer.props);
        }
        if let Some(compiler) = &self.compiler {
            merged.merge(&compiler.props);
        }
        if let Some(core) = &self.core {
            merged.merge(&core.props);
        }
        if let Some(board) = &self.board {
            merged.merge(&board.props);
        }
        merged.merge(&self.sketch_settings);
        merged.merge(&self.parameters);
        merged.merge(&self.settings);
        merged
    }

    pub fn merged_get(&self, key: &str) -> Option<String> {
        self.merged().get(key).map(String::from)
    }

    /// Per-(core, board) archive cache directory for the current target.
    pub fn cache_folder(&self) -> Option<PathBuf> {
        let core = self.core.as_ref()?;
        let board = self.board.as_ref()?;
        Some(self.cache_root.join(&core.name).join(&board.name))
    }

    // Output capture. While a capture is active, stream lines accumulate
    // in memory instead of reaching the sinks.

    pub fn start_capture(&mut self, capture_errors: bool) {
        self.capture_errors = capture_errors;
        self.capture = Some(String::new());
    }

    pub fn end_capture(&mut self) -> String {
        self.capture.take().unwrap_or_default()
    }

    pub fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    // Abort plumbing. The flag is shared with the process runner, which
    // honors it by force-killing the child mid-drain.

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.registry.kill_all();
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    // Reporting, delegated to the injected sinks.

    pub fn message(&self, text: &str) {
        self.reporter.message(text);
    }

    pub fn warning(&self, text: &str) {
        self.reporter.warning(text);
    }

    pub fn error(&self, text: &str) {
        self.reporter.error(text);
    }

    pub fn heading(&self, text: &str) {
        self.reporter.heading(text);
    }

    pub fn bullet(&self, text: &str) {
        self.reporter.bullet(text);
    }

    pub fn bullet2(&self, text: &str) {
        self.reporter.bullet2(text);
    }

    pub fn command(&self, text: &str) {
        self.reporter.command(text);
    }

    pub fn progress(&self, percent: u8) {
        self.reporter.progress(percent);
    }

    pub fn raw_output(&self, text: &str) {
        self.reporter.raw_output(text);
    }

    pub fn raw_error(&self, text: &str) {
        self.reporter.raw_error(text);
    }

    /// Deliver one completed stdout line: capture buffer when active,
    /// message sink otherwise.
    pub fn message_stream(&mut self, line: &str) {
        if let Some(capture) = &mut self.capture {
            capture.push_str(line);
            capture.push('\n');
        } else {
            self.reporter.message(line);
        }
    }

    /// Deliver one completed stderr line. Captured only when the capture
    /// was opened with `capture_errors`.
    pub fn error_stream(&mut self, line: &str) {
        if self.capture.is_some() && self.capture_errors {
            let capture = self.capture.as_mut().unwrap();
            capture.push_str(line);
            capture.push('\n');
        } else {
            self.reporter.error(line);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TargetBundle;
    use crate::props::PropertyStore;

    fn bundle(name: &str, props: &str) -> TargetBundle {
        TargetBundle {
            name: name.to_string(),
            root: std::env::temp_dir(),
            props: PropertyStore::parse(props),
        }
    }

    fn test_context() -> Context {
        Context::new(
            Box::new(testing::RecordingReporter::default()),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_merge_precedence_board_over_compiler() {
        let mut ctx = test_context();
        ctx.compiler = Some(bundle("gcc", "flags=-Os\nk=compiler\n"));
        ctx.board = Some(bundle("uno", "k=board\n"));
        assert_eq!(ctx.merged_get("k").as_deref(), Some("board"));
        assert_eq!(ctx.merged_get("flags").as_deref(), Some("-Os"));
    }

    #[test]
    fn test_ephemeral_settings_override_everything() {
        let mut ctx = test_context();
        ctx.board = Some(bundle("uno", "k=board\n"));
        ctx.sketch_settings.set("k", "sketch");
        ctx.set("k", "run");
        assert_eq!(ctx.merged_get("k").as_deref(), Some("run"));
        ctx.clear_settings();
        assert_eq!(ctx.merged_get("k").as_deref(), Some("sketch"));
    }

    #[test]
    fn test_merged_is_recomputed_not_cached() {
        let mut ctx = test_context();
        ctx.set("x", "1");
        assert_eq!(ctx.merged_get("x").as_deref(), Some("1"));
        ctx.set("x", "2");
        assert_eq!(ctx.merged_get("x").as_deref(), Some("2"));
    }

    #[test]
    fn test_capture_diverts_stream_lines() {
        let mut ctx = test_context();
        ctx.start_capture(false);
        ctx.message_stream("hello");
        ctx.error_stream("oops");
        assert_eq!(ctx.end_capture(), "hello\n");
        // stderr bypassed the capture and went to the error sink
    }
}
