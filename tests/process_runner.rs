//! Process runner behavior against real child processes.

#![cfg(unix)]

use saxe::context::{Context, LineParser, Reporter};
use saxe::exec;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Record {
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

struct TestReporter(Arc<Record>);

impl Reporter for TestReporter {
    fn message(&self, text: &str) {
        self.0.messages.lock().unwrap().push(text.to_string());
    }
    fn warning(&self, _text: &str) {}
    fn error(&self, text: &str) {
        self.0.errors.lock().unwrap().push(text.to_string());
    }
    fn heading(&self, _text: &str) {}
    fn bullet(&self, _text: &str) {}
    fn command(&self, _text: &str) {}
    fn progress(&self, _percent: u8) {}
}

fn test_context() -> (Context, Arc<Record>) {
    let record = Arc::new(Record::default());
    let ctx = Context::new(
        Box::new(TestReporter(Arc::clone(&record))),
        std::env::temp_dir(),
    );
    (ctx, record)
}

#[test]
fn test_success_is_exit_code_zero() {
    let (mut ctx, _) = test_context();
    assert!(exec::run_command(&mut ctx, "/bin/sh::-c::exit 0", None, true).unwrap());
    assert!(!exec::run_command(&mut ctx, "/bin/sh::-c::exit 3", None, true).unwrap());
}

#[test]
fn test_spawn_failure_reports_and_returns_false() {
    let (mut ctx, record) = test_context();
    let ok = exec::run_command(&mut ctx, "/no/such/binary-anywhere::arg", None, true).unwrap();
    assert!(!ok);
    assert_eq!(record.errors.lock().unwrap().len(), 1);
}

#[test]
fn test_trailing_partial_line_delivered_exactly_once() {
    let (mut ctx, _) = test_context();
    ctx.start_capture(false);
    assert!(exec::run_command(&mut ctx, "/bin/sh::-c::printf partial", None, true).unwrap());
    assert_eq!(ctx.end_capture(), "partial\n");
}

#[test]
fn test_lines_delivered_in_stream_order() {
    let (mut ctx, _) = test_context();
    ctx.start_capture(false);
    assert!(exec::run_command(
        &mut ctx,
        "/bin/sh::-c::printf 'one\\ntwo\\nthree'",
        None,
        true
    )
    .unwrap());
    assert_eq!(ctx.end_capture(), "one\ntwo\nthree\n");
}

#[test]
fn test_stderr_routes_to_error_sink() {
    let (mut ctx, record) = test_context();
    assert!(exec::run_command(&mut ctx, "/bin/sh::-c::echo oops >&2", None, true).unwrap());
    assert_eq!(record.errors.lock().unwrap().as_slice(), ["oops"]);
    assert!(record.messages.lock().unwrap().is_empty());
}

#[test]
fn test_env_spec_values_reach_the_child() {
    let (mut ctx, _) = test_context();
    ctx.set("flavor", "crunchy");
    ctx.start_capture(false);
    assert!(exec::run_command(
        &mut ctx,
        "/bin/sh::-c::printf \"$SNACK\"",
        Some("SNACK=${flavor}"),
        true
    )
    .unwrap());
    assert_eq!(ctx.end_capture(), "crunchy\n");
}

struct Uppercaser;

impl LineParser for Uppercaser {
    fn rewrite(&self, line: &str) -> String {
        line.to_uppercase()
    }
}

#[test]
fn test_line_parser_rewrites_before_delivery() {
    let (mut ctx, record) = test_context();
    ctx.parser = Some(Box::new(Uppercaser));
    assert!(exec::run_command(&mut ctx, "/bin/sh::-c::echo quiet", None, true).unwrap());
    assert_eq!(record.messages.lock().unwrap().as_slice(), ["QUIET"]);
}

#[test]
fn test_abort_kills_child_and_reports_aborted() {
    let (mut ctx, record) = test_context();
    let abort = ctx.abort_flag();

    // Trip the abort while the child is still sleeping.
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        abort.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let ok = exec::run_command(&mut ctx, "/bin/sh::-c::sleep 30", None, true).unwrap();
    trigger.join().unwrap();

    assert!(!ok);
    assert!(record
        .errors
        .lock()
        .unwrap()
        .iter()
        .any(|e| e == "Aborted"));
    assert_eq!(ctx.registry.live_count(), 0);
}
