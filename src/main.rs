//! # sx CLI Entry Point
//!
//! Parses CLI arguments using clap and routes commands to the engine.
//!
//! ## Command Structure
//!
//! - **Build**: `build`, `clean`, `watch`
//! - **Flash**: `upload`
//! - **Libraries**: `libs list`, `libs resolve`
//! - **Scripts**: `run-script`
//! - **Maintenance**: `cache`, `completions`

use anyhow::{bail, Context as _, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::*;
use std::fs;

use saxe::build::Pipeline;
use saxe::builtin::BuiltinRegistry;
use saxe::cache;
use saxe::catalog::{BundleKind, Catalog};
use saxe::config::{self, SxConfig};
use saxe::context::Context;
use saxe::libs::LibraryCatalog;
use saxe::sketch::Sketch;
use saxe::ui::{ConsoleReporter, Table};
use saxe::upload;
use saxe::watch;

#[derive(Parser)]
#[command(name = "sx")]
#[command(about = "The embedded firmware build engine", version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct TargetArgs {
    /// Override the board selected in sx.toml
    #[arg(long)]
    board: Option<String>,
    /// Override the core selected in sx.toml
    #[arg(long)]
    core: Option<String>,
    /// Override the compiler selected in sx.toml
    #[arg(long)]
    compiler: Option<String>,
    /// Override the programmer selected in sx.toml
    #[arg(long)]
    programmer: Option<String>,
    /// Serial port for upload recipes
    #[arg(short, long)]
    port: Option<String>,
    /// Ephemeral settings applied on top of everything (key=value)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// Show expanded commands as they run
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the sketch in the current directory
    Build {
        #[command(flatten)]
        target: TargetArgs,
        /// Purge the archive cache for this target pair first
        #[arg(long)]
        purge: bool,
    },
    /// Compile and flash through the selected programmer
    Upload {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Remove the build folder
    Clean,
    /// Rebuild whenever a sketch source changes
    Watch {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Inspect the library collections
    Libs {
        #[command(subcommand)]
        command: LibsCommands,
    },
    /// Execute a named script key from the merged configuration
    RunScript {
        key: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Manage the archive cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum LibsCommands {
    /// List every library visible for the selected target
    List {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Explain where an include would resolve from
    Resolve {
        include: String,
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print cache directory location
    Path,
    /// List cached target pairs
    List,
    /// Clear all cached archives
    Clean,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build { target, purge } => cmd_build(&target, purge),
        Commands::Upload { target } => cmd_upload(&target),
        Commands::Clean => cmd_clean(),
        Commands::Watch { target } => cmd_watch(&target),
        Commands::Libs { command } => match command {
            LibsCommands::List { target } => cmd_libs_list(&target),
            LibsCommands::Resolve { include, target } => cmd_libs_resolve(&include, &target),
        },
        Commands::RunScript { key, target } => cmd_run_script(&key, &target),
        Commands::Cache { command } => match command {
            CacheCommands::Path => cache::print_path(),
            CacheCommands::List => cache::list(),
            CacheCommands::Clean => cache::clean(),
        },
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "sx", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "x".red(), e);
        std::process::exit(1);
    }
}

/// Everything one engine invocation needs, wired together from the
/// manifest, the installed catalog and the CLI overrides.
struct Session {
    ctx: Context,
    libraries: LibraryCatalog,
    sketch: Sketch,
}

fn open_session(target: &TargetArgs) -> Result<Session> {
    let cwd = std::env::current_dir()?;
    let manifest = config::load_config(&cwd)?;
    let install_root = cache::default_install_root()?;
    let catalog = Catalog::scan(&install_root)?;

    let reporter = ConsoleReporter::new(target.verbose);
    let mut ctx = Context::new(Box::new(reporter), cache::default_root()?);
    ctx.verbose = target.verbose;

    select_bundles(&mut ctx, &catalog, target, &manifest)?;
    apply_manifest_settings(&mut ctx, &manifest);

    ctx.port = target
        .port
        .clone()
        .or_else(|| manifest.target.as_ref().and_then(|t| t.port.clone()));

    for pair in &target.set {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--set takes KEY=VALUE, got '{}'", pair);
        };
        ctx.set(key, value);
    }

    let libraries = build_library_catalog(&ctx, &install_root);
    let sketch = Sketch::load(&cwd)?;
    Ok(Session {
        ctx,
        libraries,
        sketch,
    })
}

fn select_bundles(
    ctx: &mut Context,
    catalog: &Catalog,
    target: &TargetArgs,
    manifest: &SxConfig,
) -> Result<()> {
    let manifest_target = manifest.target.as_ref();
    let selections = [
        (BundleKind::Board, &target.board, manifest_target.and_then(|t| t.board.clone())),
        (BundleKind::Core, &target.core, manifest_target.and_then(|t| t.core.clone())),
        (
            BundleKind::Compiler,
            &target.compiler,
            manifest_target.and_then(|t| t.compiler.clone()),
        ),
        (
            BundleKind::Programmer,
            &target.programmer,
            manifest_target.and_then(|t| t.programmer.clone()),
        ),
    ];

    for (kind, override_name, manifest_name) in selections {
        let Some(name) = override_name.clone().or(manifest_name) else {
            continue;
        };
        let bundle = catalog.get(kind, &name).cloned().with_context(|| {
            format!(
                "Unknown {} '{}'. Installed {}: {}",
                kind.definition_file().trim_end_matches(".txt"),
                name,
                kind.plural(),
                catalog.names(kind).join(", ")
            )
        })?;
        match kind {
            BundleKind::Board => ctx.board = Some(bundle),
            BundleKind::Core => ctx.core = Some(bundle),
            BundleKind::Compiler => ctx.compiler = Some(bundle),
            BundleKind::Programmer => ctx.programmer = Some(bundle),
        }
    }
    Ok(())
}

fn apply_manifest_settings(ctx: &mut Context, manifest: &SxConfig) {
    if let Some(build) = &manifest.build {
        if let Some(settings) = &build.settings {
            for (key, value) in settings {
                ctx.sketch_settings.set(key.clone(), value.clone());
            }
        }
    }
    if let Some(options) = &manifest.options {
        for (group, selection) in options {
            ctx.sketch_settings
                .set(format!("option.{}", group), selection.clone());
        }
    }
}

fn build_library_catalog(ctx: &Context, install_root: &std::path::Path) -> LibraryCatalog {
    let mut libraries = LibraryCatalog::from_roots(
        ctx.board.as_ref().map(|b| b.root.as_path()),
        ctx.core.as_ref().map(|b| b.root.as_path()),
        ctx.compiler.as_ref().map(|b| b.root.as_path()),
        Some(&install_root.join("sketchbook")),
    );
    let categories_root = install_root.join("libraries");
    if let Ok(entries) = fs::read_dir(&categories_root) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                libraries.add_category(name, &entry.path());
            }
        }
    }
    libraries
}

fn cmd_build(target: &TargetArgs, purge: bool) -> Result<()> {
    let mut session = open_session(target)?;
    let mut pipeline = Pipeline::new(&mut session.ctx, &session.libraries, &mut session.sketch);
    if purge {
        pipeline.request_purge();
    }
    if !pipeline.build()? {
        std::process::exit(1);
    }
    println!("{} Build finished", "✓".green());
    Ok(())
}

fn cmd_upload(target: &TargetArgs) -> Result<()> {
    let mut session = open_session(target)?;
    let builtins = BuiltinRegistry::with_defaults();
    if !upload::upload(
        &mut session.ctx,
        &builtins,
        &session.libraries,
        &mut session.sketch,
    )? {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_clean() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let build = cwd.join("build");
    if build.exists() {
        fs::remove_dir_all(&build).context("Failed to remove build directory")?;
        println!("{} Build directory cleaned", "✓".green());
    } else {
        println!("{} Nothing to clean", "!".yellow());
    }
    Ok(())
}

fn cmd_watch(target: &TargetArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let build_folder = cwd.join("build");
    let target = target.clone();
    watch::watch(&cwd, &build_folder, move || {
        let mut session = open_session(&target)?;
        let mut pipeline =
            Pipeline::new(&mut session.ctx, &session.libraries, &mut session.sketch);
        if pipeline.build()? {
            println!("{} Build finished", "✓".green());
        }
        Ok(())
    })
}

fn cmd_libs_list(target: &TargetArgs) -> Result<()> {
    let session = open_session(target)?;
    let mut table = Table::new(&["Library", "Sources", "Folder"]);
    for lib in session.libraries.all() {
        table.add_row(vec![
            lib.name.clone(),
            if lib.header_only {
                "header-only".to_string()
            } else {
                lib.sources.len().to_string()
            },
            lib.folder.display().to_string(),
        ]);
    }
    if table.is_empty() {
        println!("{} No libraries found for this target.", "ℹ".blue());
    } else {
        table.print();
    }
    Ok(())
}

fn cmd_libs_resolve(include: &str, target: &TargetArgs) -> Result<()> {
    let session = open_session(target)?;
    match session.sketch.find_library(&session.libraries, include) {
        Some(lib) => {
            println!(
                "{} {} resolves to {} ({})",
                "✓".green(),
                include,
                lib.name.bold(),
                lib.folder.display()
            );
            if !lib.required.is_empty() {
                println!("  requires: {}", lib.required.join(", "));
            }
        }
        None => {
            println!(
                "{} {} does not resolve to an installed library; it will be treated as a system header.",
                "!".yellow(),
                include
            );
        }
    }
    Ok(())
}

fn cmd_run_script(key: &str, target: &TargetArgs) -> Result<()> {
    let mut session = open_session(target)?;
    let builtins = BuiltinRegistry::with_defaults();
    let ok = saxe::script::execute_key(&mut session.ctx, &builtins, key, false)?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
