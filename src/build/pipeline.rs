//! The staged build pipeline.
//!
//! Each stage runs only if the previous one succeeded; the first failure
//! reports one named error and stops the build. Compilation is
//! incremental at both file and archive granularity: a target whose
//! modification time is strictly newer than every one of its inputs is
//! skipped without touching the process runner.
//!
//! Stage order: prepare sources, compile sketch objects, compile and
//! archive the core groups, compile and archive each imported library,
//! link, extract the EEPROM image, optionally produce a listing, convert
//! to the final firmware image.

use crate::context::Context;
use crate::exec;
use crate::expand;
use crate::libs::LibraryCatalog;
use crate::props::PropertyStore;
use crate::sketch::Sketch;
use anyhow::{Context as _, Result};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const GROUP_SCOPES: [&str; 3] = ["compiler.library", "core.library", "board.library"];

pub struct Pipeline<'a> {
    ctx: &'a mut Context,
    catalog: &'a LibraryCatalog,
    sketch: &'a mut Sketch,
    /// `compile_commands.json` entries accumulated as files compile.
    compile_db: Vec<serde_json::Value>,
    pre_purge: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a mut Context, catalog: &'a LibraryCatalog, sketch: &'a mut Sketch) -> Self {
        Self {
            ctx,
            catalog,
            sketch,
            compile_db: Vec::new(),
            pre_purge: false,
        }
    }

    /// Force a cache purge before the next build.
    pub fn request_purge(&mut self) {
        self.pre_purge = true;
    }

    pub fn build(&mut self) -> Result<bool> {
        if self.ctx.board.is_none() {
            self.ctx.error(
                "You have no board selected. You must select a board before you can compile.",
            );
            return Ok(false);
        }
        if self.ctx.core.is_none() {
            self.ctx
                .error("You have no core selected. You must select a core before you can compile.");
            return Ok(false);
        }
        if self.ctx.compiler.is_none() {
            self.ctx.error(
                "You have no compiler selected. You must select a compiler before you can compile.",
            );
            return Ok(false);
        }

        let cache = self.cache_folder()?;
        if self.pre_purge || self.options_changed(&cache)? {
            self.pre_purge = false;
            if cache.exists() {
                fs::remove_dir_all(&cache)
                    .with_context(|| format!("Failed to purge {}", cache.display()))?;
            }
        }
        fs::create_dir_all(&cache)
            .with_context(|| format!("Failed to create {}", cache.display()))?;
        self.save_option_state(&cache)?;

        self.ctx.message("Preparing sources...");
        self.ctx.progress(0);
        self.sketch.clean_files()?;
        self.sketch.update_library_list(self.catalog)?;
        self.sketch.prepare(self.ctx)?;

        let includes = self.generate_includes();
        self.ctx.set("includes", includes);
        self.ctx.set("filename", self.sketch.name.clone());
        self.ctx
            .set("build.path", self.sketch.build_folder.display().to_string());
        for flag_type in ["flags", "cflags", "cppflags", "ldflags"] {
            let flags = self.option_flags(flag_type);
            self.ctx.set(format!("option.{}", flag_type), flags);
        }

        self.precopy()?;

        self.ctx.message("Compiling sketch...");
        self.ctx.progress(10);
        let Some(objects) = self.compile_sketch()? else {
            return Ok(self.fail("Failed compiling sketch"));
        };

        self.ctx.message("Compiling core...");
        self.ctx.progress(20);
        if !self.compile_core()? {
            return Ok(self.fail("Failed compiling core"));
        }

        self.ctx.message("Compiling libraries...");
        self.ctx.progress(30);
        if !self.compile_libraries()? {
            return Ok(self.fail("Failed compiling libraries"));
        }

        self.ctx.message("Linking sketch...");
        self.ctx.progress(40);
        if !self.link(&objects)? {
            return Ok(self.fail("Failed linking sketch"));
        }

        self.ctx.progress(50);
        if !self.run_recipe("compile.eep")? {
            return Ok(self.fail("Failed extracting EEPROM image"));
        }

        self.ctx.progress(60);
        if !self.listing()? {
            return Ok(self.fail("Failed generating listing"));
        }

        self.ctx.progress(70);
        if !self.run_recipe("compile.hex")? {
            return Ok(self.fail("Failed converting to firmware image"));
        }

        self.write_compile_db()?;

        self.ctx.message("Done compiling.");
        self.ctx.progress(100);
        Ok(true)
    }

    fn fail(&self, message: &str) -> bool {
        // An abort already reported itself; a second error would read as a
        // build defect.
        if !self.ctx.aborted() {
            self.ctx.error(message);
        }
        false
    }

    fn cache_folder(&self) -> Result<PathBuf> {
        self.ctx
            .cache_folder()
            .context("No cache folder without a core and board")
    }

    fn cache_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.cache_folder()?.join(name))
    }

    // Option groups. A group marked `purge=true` invalidates the archive
    // cache whenever its selection changes between builds.

    fn option_selection(&self, props: &PropertyStore, group: &str) -> Option<String> {
        props
            .get(&format!("option.{}", group))
            .or_else(|| props.get(&format!("options.{}.default", group)))
            .map(String::from)
    }

    fn option_flags(&self, flag_type: &str) -> String {
        let props = self.ctx.merged();
        let mut out = String::new();
        for group in props.child_keys_of("options") {
            let Some(selection) = self.option_selection(&props, &group) else {
                continue;
            };
            let key = format!("options.{}.{}.{}", group, selection, flag_type);
            if let Some(flags) = props.get(&key) {
                if !out.is_empty() {
                    out.push_str("::");
                }
                out.push_str(flags);
            }
        }
        out
    }

    fn options_changed(&self, cache: &Path) -> Result<bool> {
        let state_file = cache.join(".option-state");
        if !state_file.exists() {
            return Ok(false);
        }
        let saved = PropertyStore::load(&state_file)?;
        let props = self.ctx.merged();
        for group in props.child_keys_of("options") {
            if props.get(&format!("options.{}.purge", group)) != Some("true") {
                continue;
            }
            let current = self.option_selection(&props, &group).unwrap_or_default();
            if saved.get(&group).unwrap_or_default() != current {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn save_option_state(&self, cache: &Path) -> Result<()> {
        let props = self.ctx.merged();
        let mut out = String::new();
        for group in props.child_keys_of("options") {
            let current = self.option_selection(&props, &group).unwrap_or_default();
            out.push_str(&format!("{}={}\n", group, current));
        }
        fs::write(cache.join(".option-state"), out)?;
        Ok(())
    }

    /// Copy helper files named by `compile.precopy` from the compiler,
    /// core or board folder into the build folder (toolchains that need
    /// runtime files next to the working directory).
    fn precopy(&mut self) -> Result<()> {
        let Some(recipe) = self.ctx.merged_get("compile.precopy") else {
            return Ok(());
        };
        let expanded = expand::expand(self.ctx, &recipe)?;
        for name in expanded.split("::").filter(|s| !s.trim().is_empty()) {
            let roots = [
                self.ctx.compiler.as_ref().map(|b| b.root.clone()),
                self.ctx.core.as_ref().map(|b| b.root.clone()),
                self.ctx.board.as_ref().map(|b| b.root.clone()),
            ];
            for root in roots.into_iter().flatten() {
                let src = root.join(name.trim());
                if src.exists() {
                    let dest = self.sketch.build_folder.join(src.file_name().unwrap_or_default());
                    fs::copy(&src, &dest)
                        .with_context(|| format!("Failed to precopy {}", src.display()))?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// `-I` include list: core group paths, imported library folders, the
    /// board folder, the build folder and the sketch folder.
    fn generate_includes(&self) -> String {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for (_, paths) in self.core_groups() {
            dirs.extend(paths);
        }
        for name in &self.sketch.ordered {
            if let Some(lib) = self.sketch.imported.get(name) {
                dirs.push(lib.folder.clone());
            }
        }
        if let Some(board) = &self.ctx.board {
            dirs.push(board.root.clone());
        }
        dirs.push(self.sketch.build_folder.clone());
        dirs.push(self.sketch.folder.clone());

        dirs.iter()
            .map(|d| format!("-I{}", d.display()))
            .collect::<Vec<_>>()
            .join("::")
    }

    /// The core source groups: `compiler.library.*`, `core.library.*` and
    /// `board.library.*` keys list `::`-separated paths relative to their
    /// owning bundle.
    fn core_groups(&self) -> Vec<(String, Vec<PathBuf>)> {
        let props = self.ctx.merged();
        let mut groups = Vec::new();
        for scope in GROUP_SCOPES {
            let root = match scope {
                "compiler.library" => self.ctx.compiler.as_ref().map(|b| b.root.clone()),
                "core.library" => self.ctx.core.as_ref().map(|b| b.root.clone()),
                _ => self.ctx.board.as_ref().map(|b| b.root.clone()),
            };
            let Some(root) = root else {
                continue;
            };
            for name in props.child_keys_of(scope) {
                let Some(paths) = props.get(&format!("{}.{}", scope, name)) else {
                    continue;
                };
                if paths.trim().is_empty() {
                    continue;
                }
                let dirs: Vec<PathBuf> = paths
                    .split("::")
                    .map(|p| root.join(p))
                    .filter(|p| p.is_dir())
                    .collect();
                groups.push((name, dirs));
            }
        }
        groups
    }

    // Single-file compilation with the uniform incremental rule: an
    // object strictly newer than its source is reused as-is.

    fn compile_file(&mut self, dest_dir: &Path, src: &Path) -> Result<Option<PathBuf>> {
        let file_name = src.file_name().unwrap_or_default().to_string_lossy();
        let recipe_key = if file_name.ends_with(".c") {
            "compile.c"
        } else if file_name.ends_with(".S") {
            "compile.S"
        } else if file_name.ends_with(".cpp")
            || file_name.ends_with(".cxx")
            || file_name.ends_with(".cc")
        {
            "compile.cpp"
        } else {
            self.ctx
                .message(&format!("Error: I don't know how to compile {}", file_name));
            return Ok(None);
        };

        let Some(recipe) = self.ctx.merged_get(recipe_key) else {
            self.ctx
                .message(&format!("Error: no {} recipe defined", recipe_key));
            return Ok(None);
        };

        let stem = src.file_stem().unwrap_or_default().to_string_lossy();
        let dest = dest_dir.join(format!("{}.o", stem));

        if is_newer_than_all(&dest, std::iter::once(src.to_path_buf()))? {
            if self.ctx.verbose {
                self.ctx
                    .message(&format!("Skipping {} as not modified.", src.display()));
            }
            return Ok(Some(dest));
        }

        self.ctx.set("source.name", src.display().to_string());
        self.ctx.set("object.name", dest.display().to_string());

        let command = expand::expand(self.ctx, &recipe)?;
        self.record_compile(&command, src);

        if !exec::run_command(self.ctx, &command, None, false)? {
            return Ok(None);
        }
        if !dest.exists() {
            return Ok(None);
        }
        Ok(Some(dest))
    }

    fn record_compile(&mut self, command: &str, src: &Path) {
        let argv = exec::split_command(command);
        self.compile_db.push(json!({
            "directory": self.sketch.build_folder.display().to_string(),
            "command": argv.join(" "),
            "file": src.display().to_string(),
        }));
    }

    fn write_compile_db(&self) -> Result<()> {
        let out = serde_json::to_string_pretty(&self.compile_db)?;
        fs::write(self.sketch.build_folder.join("compile_commands.json"), out)?;
        Ok(())
    }

    fn compile_list(&mut self, dest_dir: &Path, files: &[PathBuf]) -> Result<Option<Vec<PathBuf>>> {
        let mut objects = Vec::new();
        for file in files {
            match self.compile_file(dest_dir, file)? {
                Some(obj) => objects.push(obj),
                None => return Ok(None),
            }
        }
        Ok(Some(objects))
    }

    /// Compile the prepared sketch sources, plus any board-mandated extra
    /// files and the sketch's `utility/` folder.
    fn compile_sketch(&mut self) -> Result<Option<Vec<PathBuf>>> {
        let build = self.sketch.build_folder.clone();
        let mut objects = Vec::new();

        // Raw binary blobs converted to linkable objects, when the core
        // knows how.
        if self.ctx.merged_get("compile.bin").is_some() {
            let blob_dir = self.sketch.folder.join("objects");
            if blob_dir.is_dir() {
                let blobs = find_files(&blob_dir, None, true);
                match self.convert_blobs(&build, &blobs)? {
                    Some(objs) => objects.extend(objs),
                    None => return Ok(None),
                }
            }
        }

        let mut sources = Vec::new();
        for ext in ["S", "c", "cpp"] {
            sources.extend(find_files(&build, Some(ext), false));
        }
        match self.compile_list(&build, &sources)? {
            Some(objs) => objects.extend(objs),
            None => return Ok(None),
        }

        // Extra sources the board insists on building with every sketch.
        if let Some(board_files) = self.ctx.merged_get("build.files") {
            if let Some(board) = self.ctx.board.as_ref().map(|b| b.root.clone()) {
                let extras: Vec<PathBuf> = board_files
                    .split("::")
                    .map(|f| board.join(f.trim()))
                    .filter(|f| f.is_file())
                    .collect();
                match self.compile_list(&build, &extras)? {
                    Some(objs) => objects.extend(objs),
                    None => return Ok(None),
                }
            }
        }

        let utility = self.sketch.folder.join("utility");
        if utility.is_dir() {
            let dest = build.join("utility");
            fs::create_dir_all(&dest)?;
            let mut sources = Vec::new();
            for ext in ["S", "c", "cpp"] {
                sources.extend(find_files(&utility, Some(ext), true));
            }
            match self.compile_list(&dest, &sources)? {
                Some(objs) => objects.extend(objs),
                None => return Ok(None),
            }
        }

        Ok(Some(objects))
    }

    /// Convert raw data files into objects with the `compile.bin` recipe.
    fn convert_blobs(&mut self, dest_dir: &Path, blobs: &[PathBuf]) -> Result<Option<Vec<PathBuf>>> {
        let Some(recipe) = self.ctx.merged_get("compile.bin") else {
            return Ok(Some(Vec::new()));
        };
        let mut objects = Vec::new();
        for blob in blobs {
            let name = blob.file_name().unwrap_or_default().to_string_lossy();
            let dest = dest_dir.join(format!("{}.o", name));
            objects.push(dest.clone());

            if is_newer_than_all(&dest, std::iter::once(blob.clone()))? {
                continue;
            }

            self.ctx.set("source.name", blob.display().to_string());
            self.ctx.set("object.name", dest.display().to_string());
            let command = expand::expand(self.ctx, &recipe)?;
            if !exec::run_command(self.ctx, &command, None, false)? {
                return Ok(None);
            }
            if !dest.exists() {
                return Ok(None);
            }
        }
        Ok(Some(objects))
    }

    fn compile_core(&mut self) -> Result<bool> {
        for (name, dirs) in self.core_groups() {
            let mut sources = Vec::new();
            for dir in &dirs {
                for ext in ["S", "c", "cpp", "cxx", "cc"] {
                    sources.extend(find_files(dir, Some(ext), false));
                }
            }
            if !self.archive_group(&format!("Core_{}", name), &sources)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Compile every source newer than the archive and fold the objects
    /// in; the object files are transient and removed after archiving.
    fn archive_group(&mut self, name: &str, sources: &[PathBuf]) -> Result<bool> {
        let archive = self.cache_file(&format!("lib{}.a", name))?;
        let Some(recipe) = self.ctx.merged_get("compile.ar") else {
            self.ctx.message("Error: no compile.ar recipe defined");
            return Ok(false);
        };
        let archive_mtime = mtime(&archive);
        let build = self.sketch.build_folder.clone();

        self.ctx.set("library", archive.display().to_string());

        for src in sources {
            if let Some(archive_mtime) = archive_mtime {
                if let Some(src_mtime) = mtime(src) {
                    if archive_mtime > src_mtime {
                        continue;
                    }
                }
            }
            let Some(object) = self.compile_file(&build, src)? else {
                return Ok(false);
            };
            self.ctx.set("object.name", object.display().to_string());
            let command = expand::expand(self.ctx, &recipe)?;
            if !exec::run_command(self.ctx, &command, None, false)? {
                return Ok(false);
            }
            let _ = fs::remove_file(&object);
        }
        Ok(true)
    }

    fn compile_libraries(&mut self) -> Result<bool> {
        for name in self.sketch.ordered.clone() {
            if !self.compile_library(&name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn compile_library(&mut self, name: &str) -> Result<bool> {
        let Some(lib) = self.sketch.imported.get(name) else {
            return Ok(true);
        };
        let sources = lib.sources.clone();
        let utility = lib.utility.clone();
        let archive = self.cache_file(&lib.archive_name())?;
        let archive_mtime = mtime(&archive);

        let Some(recipe) = self.ctx.merged_get("compile.ar") else {
            self.ctx.message("Error: no compile.ar recipe defined");
            return Ok(false);
        };

        self.ctx.set("library", archive.display().to_string());

        // The library's utility folder joins the include path only while
        // its own sources compile.
        let original_includes = self.ctx.get("includes").unwrap_or_default().to_string();
        if let Some(utility) = &utility {
            self.ctx.set(
                "includes",
                format!("{}::-I{}", original_includes, utility.display()),
            );
        }

        let build = self.sketch.build_folder.clone();
        let total = sources.len();
        let mut compiled = 0usize;

        for src in &sources {
            if let Some(archive_mtime) = archive_mtime {
                if let Some(src_mtime) = mtime(src) {
                    if archive_mtime > src_mtime {
                        continue;
                    }
                }
            }
            let object = match self.compile_file(&build, src)? {
                Some(object) => object,
                None => {
                    self.ctx.set("includes", original_includes.clone());
                    return Ok(false);
                }
            };
            self.ctx.set("object.name", object.display().to_string());
            let command = expand::expand(self.ctx, &recipe)?;
            if !exec::run_command(self.ctx, &command, None, false)? {
                let _ = fs::remove_file(&archive);
                self.ctx.set("includes", original_includes.clone());
                return Ok(false);
            }
            let _ = fs::remove_file(&object);

            compiled += 1;
            if total > 0 {
                if let Some(lib) = self.sketch.imported.get_mut(name) {
                    lib.compiled_percent = (compiled * 100 / total) as u8;
                }
            }
        }

        self.ctx.set("includes", original_includes);
        Ok(true)
    }

    fn link(&mut self, objects: &[PathBuf]) -> Result<bool> {
        let props = self.ctx.merged();
        let Some(recipe) = props.get("compile.link").map(String::from) else {
            self.ctx.message("Error: no compile.link recipe defined");
            return Ok(false);
        };

        let cache = self.cache_folder()?;
        self.ctx
            .set("libraries.path", cache.display().to_string());

        let never_include: Vec<String> = props
            .get("neverinclude")
            .unwrap_or_default()
            .replace(' ', "::")
            .split("::")
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let lib_option = props
            .get("compile.liboption")
            .unwrap_or("-l${library}")
            .to_string();

        let mut lib_list = String::new();
        for name in self.sketch.ordered.clone() {
            let Some(lib) = self.sketch.imported.get(&name) else {
                continue;
            };
            let archive = self.cache_file(&lib.archive_name())?;
            let header = format!("{}.h", lib.name);
            if !archive.exists() || never_include.contains(&header) {
                continue;
            }
            self.ctx.set("library", lib.link_name().to_string());
            lib_list.push_str("::");
            lib_list.push_str(&expand::expand(self.ctx, &lib_option)?);
        }
        for (name, _) in self.core_groups() {
            self.ctx.set("library", format!("Core_{}", name));
            lib_list.push_str("::");
            lib_list.push_str(&expand::expand(self.ctx, &lib_option)?);
        }
        self.ctx.set("libraries", lib_list);

        let object_list = objects
            .iter()
            .map(|o| o.display().to_string())
            .collect::<Vec<_>>()
            .join("::");
        self.ctx.set("object.filelist", object_list);
        self.ctx
            .set("build.path", self.sketch.build_folder.display().to_string());

        let command = expand::expand(self.ctx, &recipe)?;
        exec::run_command(self.ctx, &command, None, false)
    }

    /// Run an artifact recipe; a core that does not define it succeeds
    /// vacuously. Host-qualified variants shadow the bare key.
    fn run_recipe(&mut self, key: &str) -> Result<bool> {
        let Some(recipe) = self.ctx.merged().get_for_host(key).map(String::from) else {
            return Ok(true);
        };
        let command = expand::expand(self.ctx, &recipe)?;
        exec::run_command(self.ctx, &command, None, false)
    }

    /// Generate the disassembly listing when the core supports it and the
    /// configuration asks for it. The recipe's stdout is captured and
    /// written to `<sketch>.lss`.
    fn listing(&mut self) -> Result<bool> {
        if self.ctx.merged_get("compile.lss").is_none() {
            return Ok(true);
        }
        if self.ctx.merged_get("compiler.generate_lss").as_deref() != Some("true") {
            return Ok(true);
        }

        let target = self
            .sketch
            .build_folder
            .join(format!("{}.lss", self.sketch.name));
        if target.exists() {
            let _ = fs::remove_file(&target);
        }

        self.ctx.start_capture(false);
        let ok = self.run_recipe("compile.lss")?;
        let captured = self.ctx.end_capture();
        if !ok {
            return Ok(false);
        }
        fs::write(&target, captured)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        Ok(true)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// True when `target` exists and is strictly newer than every input.
fn is_newer_than_all(target: &Path, inputs: impl Iterator<Item = PathBuf>) -> Result<bool> {
    let Some(target_mtime) = mtime(target) else {
        return Ok(false);
    };
    for input in inputs {
        match mtime(&input) {
            Some(input_mtime) if target_mtime > input_mtime => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Non-hidden files under `folder`, optionally filtered by extension,
/// optionally recursive.
fn find_files(folder: &Path, extension: Option<&str>, recurse: bool) -> Vec<PathBuf> {
    let walker = if recurse {
        WalkDir::new(folder)
    } else {
        WalkDir::new(folder).max_depth(1)
    };
    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter(|e| match extension {
            Some(ext) => e.path().extension().map(|x| x == ext).unwrap_or(false),
            None => true,
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}
