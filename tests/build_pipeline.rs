//! End-to-end pipeline tests against a fake shell toolchain.
//!
//! Every recipe is a `/bin/sh -c` one-liner that logs what it compiled
//! and touches its output, which lets the tests observe exactly which
//! build steps invoked the process runner.

#![cfg(unix)]

use saxe::build::Pipeline;
use saxe::catalog::TargetBundle;
use saxe::context::{Context, Reporter};
use saxe::libs::LibraryCatalog;
use saxe::props::PropertyStore;
use saxe::sketch::Sketch;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Record {
    errors: Mutex<Vec<String>>,
}

struct TestReporter(Arc<Record>);

impl Reporter for TestReporter {
    fn message(&self, _text: &str) {}
    fn warning(&self, _text: &str) {}
    fn error(&self, text: &str) {
        self.0.errors.lock().unwrap().push(text.to_string());
    }
    fn heading(&self, _text: &str) {}
    fn bullet(&self, _text: &str) {}
    fn command(&self, _text: &str) {}
    fn progress(&self, _percent: u8) {}
}

struct Fixture {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    sketch_folder: PathBuf,
    board_root: PathBuf,
    core_root: PathBuf,
    compiler_root: PathBuf,
    cache_root: PathBuf,
    record: Arc<Record>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let sketch_folder = root.join("blinky");
    fs::create_dir_all(&sketch_folder).unwrap();
    fs::write(
        sketch_folder.join("blinky.ino"),
        "#include <Wire.h>\n\nvoid setup() {\n}\n\nvoid loop() {\n}\n",
    )
    .unwrap();

    let board_root = root.join("boards").join("uno");
    let core_root = root.join("cores").join("avr");
    let compiler_root = root.join("compilers").join("avr-gcc");
    fs::create_dir_all(&board_root).unwrap();
    fs::create_dir_all(core_root.join("api")).unwrap();
    fs::create_dir_all(&compiler_root).unwrap();

    // One core source group plus one board-scoped library.
    fs::write(core_root.join("api").join("init.c"), "int init;\n").unwrap();
    let wire = board_root.join("libraries").join("Wire");
    fs::create_dir_all(&wire).unwrap();
    fs::write(wire.join("Wire.h"), "#pragma once\n").unwrap();
    fs::write(wire.join("Wire.cpp"), "#include \"Wire.h\"\nint wire;\n").unwrap();

    Fixture {
        cache_root: root.join("cache"),
        sketch_folder,
        board_root,
        core_root,
        compiler_root,
        record: Arc::new(Record::default()),
        dir,
    }
}

fn bundle(name: &str, root: &Path, props: &str) -> TargetBundle {
    TargetBundle {
        name: name.to_string(),
        root: root.to_path_buf(),
        props: PropertyStore::parse(props),
    }
}

fn make_context(fx: &Fixture, with_board: bool) -> Context {
    let mut ctx = Context::new(
        Box::new(TestReporter(Arc::clone(&fx.record))),
        fx.cache_root.clone(),
    );

    let compiler_props = "\
compile.c=/bin/sh::-c::echo compile ${source.name} >> ${build.path}/compile.log && touch ${object.name}\n\
compile.cpp=/bin/sh::-c::echo compile ${source.name} >> ${build.path}/compile.log && touch ${object.name}\n\
compile.S=/bin/sh::-c::echo compile ${source.name} >> ${build.path}/compile.log && touch ${object.name}\n\
compile.ar=/bin/sh::-c::touch ${library}\n\
compile.link=/bin/sh::-c::touch ${build.path}/${filename}.elf\n\
compile.eep=/bin/sh::-c::touch ${build.path}/${filename}.eep\n\
compile.hex=/bin/sh::-c::touch ${build.path}/${filename}.hex\n";

    ctx.compiler = Some(bundle("avr-gcc", &fx.compiler_root, compiler_props));
    ctx.core = Some(bundle("avr", &fx.core_root, "core.library.api=api\n"));
    if with_board {
        ctx.board = Some(bundle("uno", &fx.board_root, "name=uno\n"));
    }
    ctx
}

fn make_catalog(fx: &Fixture) -> LibraryCatalog {
    LibraryCatalog::from_roots(Some(&fx.board_root), Some(&fx.core_root), None, None)
}

fn compile_log(fx: &Fixture) -> Vec<String> {
    let log = fx.sketch_folder.join("build").join("compile.log");
    match fs::read_to_string(log) {
        Ok(text) => text.lines().map(String::from).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn test_full_build_produces_artifacts() {
    let fx = fixture();
    let mut ctx = make_context(&fx, true);
    let catalog = make_catalog(&fx);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();

    let ok = Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap();
    assert!(ok, "errors: {:?}", fx.record.errors.lock().unwrap());

    let build = fx.sketch_folder.join("build");
    assert!(build.join("blinky.cpp").exists());
    assert!(build.join("blinky.o").exists());
    assert!(build.join("blinky.elf").exists());
    assert!(build.join("blinky.eep").exists());
    assert!(build.join("blinky.hex").exists());
    assert!(build.join("compile_commands.json").exists());

    let cache = fx.cache_root.join("avr").join("uno");
    assert!(cache.join("libCore_api.a").exists());
    assert!(cache.join("libWire.a").exists());

    // One compile each: the sketch, the core group source, the library.
    let log = compile_log(&fx);
    assert_eq!(log.len(), 3, "log: {:?}", log);
}

#[test]
fn test_incremental_rebuild_skips_up_to_date_archives() {
    let fx = fixture();
    let catalog = make_catalog(&fx);

    let mut ctx = make_context(&fx, true);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());
    let after_first = compile_log(&fx).len();

    // Second build: the regenerated sketch source recompiles, but the
    // core group and library archives are newer than their inputs and
    // must not reach the process runner.
    let mut ctx = make_context(&fx, true);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());
    let log = compile_log(&fx);

    let core_compiles = log.iter().filter(|l| l.contains("init.c")).count();
    let wire_compiles = log.iter().filter(|l| l.contains("Wire.cpp")).count();
    assert_eq!(core_compiles, 1);
    assert_eq!(wire_compiles, 1);
    assert!(log.len() > after_first, "sketch source always recompiles");
}

#[test]
fn test_touched_library_source_recompiles() {
    let fx = fixture();
    let catalog = make_catalog(&fx);

    let mut ctx = make_context(&fx, true);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());

    // Make the library source newer than its archive.
    let wire_cpp = fx
        .board_root
        .join("libraries")
        .join("Wire")
        .join("Wire.cpp");
    fs::write(&wire_cpp, "#include \"Wire.h\"\nint wire = 2;\n").unwrap();

    let mut ctx = make_context(&fx, true);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());

    let log = compile_log(&fx);
    let wire_compiles = log.iter().filter(|l| l.contains("Wire.cpp")).count();
    assert_eq!(wire_compiles, 2);
}

#[test]
fn test_no_board_fails_with_one_error_and_no_processes() {
    let fx = fixture();
    let mut ctx = make_context(&fx, false);
    let catalog = make_catalog(&fx);
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();

    let ok = Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap();
    assert!(!ok);

    let errors = fx.record.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("board"));

    // Nothing ran: no build folder, no log, no cache.
    assert!(compile_log(&fx).is_empty());
    assert!(!fx.sketch_folder.join("build").exists());
}

#[test]
fn test_purge_marked_option_change_invalidates_cache() {
    let fx = fixture();
    let catalog = make_catalog(&fx);

    let opts = "options.speed.purge=true\noptions.speed.default=slow\n";
    let mut ctx = make_context(&fx, true);
    ctx.core.as_mut().unwrap().props.merge(&PropertyStore::parse(opts));
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());

    let archive = fx.cache_root.join("avr").join("uno").join("libWire.a");
    assert!(archive.exists());

    // Same selection: archives survive.
    let mut ctx = make_context(&fx, true);
    ctx.core.as_mut().unwrap().props.merge(&PropertyStore::parse(opts));
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());
    let before = compile_log(&fx).iter().filter(|l| l.contains("Wire.cpp")).count();
    assert_eq!(before, 1);

    // Changed selection on a purge-marked group: the cache is rebuilt.
    let mut ctx = make_context(&fx, true);
    ctx.core.as_mut().unwrap().props.merge(&PropertyStore::parse(opts));
    ctx.sketch_settings.set("option.speed", "fast");
    let mut sketch = Sketch::load(&fx.sketch_folder).unwrap();
    assert!(Pipeline::new(&mut ctx, &catalog, &mut sketch).build().unwrap());
    let after = compile_log(&fx).iter().filter(|l| l.contains("Wire.cpp")).count();
    assert_eq!(after, 2);
}
