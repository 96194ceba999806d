//! Process execution and output demultiplexing.
//!
//! Every external build step runs through [`run_command`]: the recipe is
//! pre-split on `::` into an argument vector (never handed to a shell),
//! spawned with piped output, and drained by two concurrent reader threads
//! so a child writing heavily to both pipes can never deadlock. Completed
//! lines pass through the installed [`LineParser`] and land in the capture
//! buffer or the message/error sinks; bytes that are not printable ASCII
//! text are echoed raw and immediately.
//!
//! Success is exit code zero, nothing else. Retry policy lives upstream in
//! the build pipeline; this module never retries.

use crate::context::Context;
use crate::expand;
use anyhow::Result;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Registry of in-flight child processes, shared across build contexts so
/// a global abort can terminate everything at once.
#[derive(Default)]
pub struct ProcessRegistry {
    children: Mutex<Vec<Arc<Mutex<Child>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, child: Child) -> Arc<Mutex<Child>> {
        let handle = Arc::new(Mutex::new(child));
        self.children.lock().unwrap().push(Arc::clone(&handle));
        handle
    }

    pub fn deregister(&self, handle: &Arc<Mutex<Child>>) {
        self.children
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, handle));
    }

    pub fn kill_all(&self) {
        for handle in self.children.lock().unwrap().iter() {
            let _ = handle.lock().unwrap().kill();
        }
    }

    pub fn live_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdout,
    Stderr,
}

enum StreamEvent {
    /// Non-text bytes, passed through uninterpreted for live echo.
    Raw(Source, String),
    /// One completed (or EOF-flushed partial) line, newline stripped.
    Line(Source, String),
    Eof(Source),
}

/// Split a `::`-delimited recipe into an argument vector: segments trimmed,
/// empties dropped, doubled slashes in the program path collapsed.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args: Vec<String> = command
        .split("::")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if let Some(program) = args.first_mut() {
        *program = program.replace("//", "/");
    }
    args
}

/// Run one external command, streaming its output through the context's
/// sinks. Returns `Ok(true)` iff the process exited with code zero.
///
/// `env` is an optional `::`-delimited list of `KEY=VALUE` pairs; each
/// value is token-expanded before being applied.
pub fn run_command(
    ctx: &mut Context,
    command: &str,
    env: Option<&str>,
    silent: bool,
) -> Result<bool> {
    let args = split_command(command);
    if args.is_empty() {
        return Ok(true);
    }

    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    if let Some(dir) = ctx.merged_get("build.path") {
        cmd.current_dir(dir);
    }

    if let Some(env) = env {
        for pair in env.split("::") {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key.trim(), expand::expand(ctx, value)?);
            }
        }
    }

    if ctx.verbose && !ctx.silence && !silent {
        ctx.command(&args.join(" "));
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            ctx.error(&format!("Failed to launch {}: {}", args[0], e));
            return Ok(false);
        }
    };

    let handle = ctx.registry.register(child);
    let result = drain_and_wait(ctx, &handle);
    ctx.registry.deregister(&handle);
    result
}

fn drain_and_wait(ctx: &mut Context, handle: &Arc<Mutex<Child>>) -> Result<bool> {
    let (tx, rx) = mpsc::channel::<StreamEvent>();

    let stdout = handle.lock().unwrap().stdout.take();
    let stderr = handle.lock().unwrap().stderr.take();

    let mut readers = Vec::new();
    if let Some(stream) = stdout {
        let tx = tx.clone();
        readers.push(thread::spawn(move || drain_stream(stream, Source::Stdout, tx)));
    }
    if let Some(stream) = stderr {
        let tx = tx.clone();
        readers.push(thread::spawn(move || drain_stream(stream, Source::Stderr, tx)));
    }
    drop(tx);

    let abort = ctx.abort_flag();
    let mut eofs = 0;
    let expected_eofs = readers.len();
    let mut aborted = false;

    while eofs < expected_eofs {
        if abort.load(std::sync::atomic::Ordering::SeqCst) {
            let _ = handle.lock().unwrap().kill();
            aborted = true;
        }
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(StreamEvent::Raw(Source::Stdout, text)) => {
                if !ctx.capturing() {
                    ctx.raw_output(&text);
                }
            }
            Ok(StreamEvent::Raw(Source::Stderr, text)) => {
                if !ctx.capturing() {
                    ctx.raw_error(&text);
                }
            }
            Ok(StreamEvent::Line(source, line)) => {
                let line = match &ctx.parser {
                    Some(parser) => parser.rewrite(&line),
                    None => line,
                };
                match source {
                    Source::Stdout => ctx.message_stream(&line),
                    Source::Stderr => ctx.error_stream(&line),
                }
            }
            Ok(StreamEvent::Eof(_)) => eofs += 1,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for reader in readers {
        let _ = reader.join();
    }

    if aborted {
        ctx.error("Aborted");
        let _ = handle.lock().unwrap().wait();
        return Ok(false);
    }

    // Both pipes are closed, so the child has finished (or is about to);
    // this wait cannot block on pipe buffers.
    let status = handle.lock().unwrap().wait()?;
    Ok(status.success())
}

/// Read one stream to EOF, assembling printable-ASCII text into lines and
/// passing everything else through raw. A trailing partial line is flushed
/// exactly once before the EOF marker.
fn drain_stream<R: Read>(mut stream: R, source: Source, tx: mpsc::Sender<StreamEvent>) {
    let mut buf = [0u8; 4096];
    let mut line = String::new();
    let mut raw = String::new();

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        for &byte in &buf[..n] {
            let is_text = (byte >= b' ' && byte < 0x7f) || byte == b'\n';
            if is_text {
                if !raw.is_empty() {
                    let _ = tx.send(StreamEvent::Raw(source, std::mem::take(&mut raw)));
                }
                if byte == b'\n' {
                    let _ = tx.send(StreamEvent::Line(source, std::mem::take(&mut line)));
                } else {
                    line.push(byte as char);
                }
            } else {
                raw.push(byte as char);
            }
        }

        if !raw.is_empty() {
            let _ = tx.send(StreamEvent::Raw(source, std::mem::take(&mut raw)));
        }
    }

    if !line.is_empty() {
        let _ = tx.send(StreamEvent::Line(source, std::mem::take(&mut line)));
    }
    let _ = tx.send(StreamEvent::Eof(source));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_trims_and_drops_empties() {
        let args = split_command("  gcc :: -c ::::src.c:: -o ::src.o ");
        assert_eq!(args, vec!["gcc", "-c", "src.c", "-o", "src.o"]);
    }

    #[test]
    fn test_split_command_collapses_doubled_slash_in_program() {
        let args = split_command("/usr//bin/gcc::-v");
        assert_eq!(args[0], "/usr/bin/gcc");
        assert_eq!(args[1], "-v");
    }

    #[test]
    fn test_drain_stream_flushes_trailing_partial_line_once() {
        let (tx, rx) = mpsc::channel();
        drain_stream(&b"one\ntwo"[..], Source::Stdout, tx);

        let mut lines = Vec::new();
        while let Ok(event) = rx.recv() {
            match event {
                StreamEvent::Line(_, line) => lines.push(line),
                StreamEvent::Eof(_) => break,
                StreamEvent::Raw(..) => panic!("no raw bytes expected"),
            }
        }
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_drain_stream_routes_non_text_bytes_raw() {
        let (tx, rx) = mpsc::channel();
        drain_stream(&b"ok\x07\nnext\n"[..], Source::Stdout, tx);

        let mut lines = Vec::new();
        let mut raws = Vec::new();
        while let Ok(event) = rx.recv() {
            match event {
                StreamEvent::Line(_, line) => lines.push(line),
                StreamEvent::Raw(_, text) => raws.push(text),
                StreamEvent::Eof(_) => break,
            }
        }
        assert_eq!(lines, vec!["ok", "next"]);
        assert_eq!(raws, vec!["\u{7}"]);
    }
}
