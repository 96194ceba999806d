//! Library discovery and dependency resolution.
//!
//! A library is a folder named for its primary header: `Wire/Wire.h` plus
//! whatever sources sit beside it. Libraries live in scoped collections —
//! the sketch's own `libraries/` folder, then the board, core and compiler
//! bundles, then named category collections, then the sketchbook — and an
//! include resolves against those scopes in that fixed order.
//!
//! Importing is transitive: a library pulls in every library its own
//! sources include. The import set is idempotent, which is also what makes
//! require-cycles terminate instead of recursing forever.

use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: [&str; 5] = ["S", "c", "cpp", "cxx", "cc"];

/// One discovered library. Collections own these; importing clones the
/// descriptor into the project so per-build state (compiled percentage)
/// stays per-build.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub folder: PathBuf,
    /// Include names this library's own sources pull in.
    pub required: Vec<String>,
    pub sources: Vec<PathBuf>,
    pub utility: Option<PathBuf>,
    pub header_only: bool,
    pub compiled_percent: u8,
}

impl Library {
    /// Probe `folder` as a library named `name`. Valid only when the
    /// primary header `<name>.h` exists at the folder root.
    pub fn discover(folder: &Path, name: &str) -> Option<Library> {
        let header = folder.join(format!("{}.h", name));
        if !header.is_file() {
            return None;
        }

        let mut sources = Vec::new();
        let mut headers = vec![header];
        for entry in WalkDir::new(folder).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let rel = path.strip_prefix(folder).unwrap_or(path);
            if rel
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
            {
                continue;
            }
            if rel.components().any(|c| c.as_os_str() == "examples") {
                continue;
            }
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_string()) else {
                continue;
            };
            if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
                sources.push(path.to_path_buf());
            } else if ext == "h" {
                headers.push(path.to_path_buf());
            }
        }
        sources.sort();

        let required = scan_required(name, sources.iter().chain(headers.iter()));
        let utility = {
            let dir = folder.join("utility");
            dir.is_dir().then_some(dir)
        };

        Some(Library {
            name: name.to_string(),
            header_only: sources.is_empty(),
            folder: folder.to_path_buf(),
            required,
            sources,
            utility,
            compiled_percent: 0,
        })
    }

    pub fn archive_name(&self) -> String {
        format!("lib{}.a", self.name)
    }

    pub fn link_name(&self) -> &str {
        &self.name
    }
}

/// Include names referenced by the given files, minus the library's own
/// header.
fn scan_required<'a>(own_name: &str, files: impl Iterator<Item = &'a PathBuf>) -> Vec<String> {
    let include = Regex::new(r#"^\s*#\s*include\s+[<"]([^>"]+)[>"]"#).unwrap();
    let mut out = Vec::new();
    for file in files {
        let Ok(text) = fs::read_to_string(file) else {
            continue;
        };
        for line in text.lines() {
            if let Some(caps) = include.captures(line) {
                let name = trim_include(&caps[1]);
                if name != own_name && !out.iter().any(|n| n == &name) {
                    out.push(name);
                }
            }
        }
    }
    out
}

/// `Wire.h` → `Wire`; names without an extension pass through.
pub fn trim_include(include: &str) -> String {
    match include.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => include.to_string(),
    }
}

/// Scan a collection directory: every subfolder carrying its primary
/// header becomes a library.
pub fn scan_collection(dir: &Path) -> HashMap<String, Library> {
    let mut out = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(lib) = Library::discover(&path, &name) {
            out.insert(name, lib);
        }
    }
    out
}

/// The scoped library collections for one build target. Injected into the
/// build context explicitly; tests assemble synthetic ones.
#[derive(Debug, Default)]
pub struct LibraryCatalog {
    board: HashMap<String, Library>,
    core: HashMap<String, Library>,
    compiler: HashMap<String, Library>,
    /// Category collections iterate in name order, which keeps resolution
    /// stable between runs.
    categories: BTreeMap<String, HashMap<String, Library>>,
    sketchbook: HashMap<String, Library>,
}

impl LibraryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from the target bundles' `libraries/` folders
    /// plus the sketchbook.
    pub fn from_roots(
        board_root: Option<&Path>,
        core_root: Option<&Path>,
        compiler_root: Option<&Path>,
        sketchbook_root: Option<&Path>,
    ) -> Self {
        let scan_root = |root: Option<&Path>| {
            root.map(|r| scan_collection(&r.join("libraries")))
                .unwrap_or_default()
        };
        Self {
            board: scan_root(board_root),
            core: scan_root(core_root),
            compiler: scan_root(compiler_root),
            categories: BTreeMap::new(),
            sketchbook: scan_root(sketchbook_root),
        }
    }

    pub fn add_category(&mut self, name: impl Into<String>, dir: &Path) {
        self.categories.insert(name.into(), scan_collection(dir));
    }

    /// Scoped search, first match wins: board, core, compiler, categories
    /// (in name order), sketchbook.
    pub fn find(&self, name: &str) -> Option<&Library> {
        if let Some(lib) = self.board.get(name) {
            return Some(lib);
        }
        if let Some(lib) = self.core.get(name) {
            return Some(lib);
        }
        if let Some(lib) = self.compiler.get(name) {
            return Some(lib);
        }
        for collection in self.categories.values() {
            if let Some(lib) = collection.get(name) {
                return Some(lib);
            }
        }
        self.sketchbook.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.board.is_empty()
            && self.core.is_empty()
            && self.compiler.is_empty()
            && self.categories.is_empty()
            && self.sketchbook.is_empty()
    }

    /// Every library visible through this catalog, deduplicated by the
    /// same precedence as [`find`].
    pub fn all(&self) -> Vec<&Library> {
        let mut seen: Vec<&Library> = Vec::new();
        let scopes: Vec<&HashMap<String, Library>> = [&self.board, &self.core, &self.compiler]
            .into_iter()
            .chain(self.categories.values())
            .chain(std::iter::once(&self.sketchbook))
            .collect();
        for scope in scopes {
            let mut names: Vec<&String> = scope.keys().collect();
            names.sort();
            for name in names {
                if !seen.iter().any(|l| &l.name == name) {
                    seen.push(&scope[name]);
                }
            }
        }
        seen
    }
}

/// Transitively import `include` into the project's import state.
///
/// Project-local libraries take absolute priority; unresolved names are
/// ordinary system headers, not errors. Returns the imported library's
/// name when the include resolved to a library.
pub fn import_library(
    catalog: &LibraryCatalog,
    sketch_libs: Option<&Path>,
    imported: &mut HashMap<String, Library>,
    ordered: &mut Vec<String>,
    include: &str,
) -> Result<Option<String>> {
    let name = trim_include(include);

    // Idempotent: already-imported names return immediately, which is
    // what makes require-cycles terminate.
    if imported.contains_key(&name) {
        return Ok(Some(name));
    }

    let lib = resolve(catalog, sketch_libs, &name);
    let Some(lib) = lib else {
        return Ok(None);
    };

    let required = lib.required.clone();
    imported.insert(name.clone(), lib);
    ordered.push(name.clone());

    for req in required {
        import_library(catalog, sketch_libs, imported, ordered, &req)?;
    }
    Ok(Some(name))
}

fn resolve(catalog: &LibraryCatalog, sketch_libs: Option<&Path>, name: &str) -> Option<Library> {
    if let Some(libs_dir) = sketch_libs {
        let folder = libs_dir.join(name);
        if folder.is_dir() {
            if let Some(lib) = Library::discover(&folder, name) {
                return Some(lib);
            }
        }
    }
    catalog.find(name).cloned()
}
