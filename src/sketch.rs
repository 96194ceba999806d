//! The sketch: the user's source tree being built.
//!
//! Sketch sources (`.ino`/`.pde`) are not quite C++: they may omit forward
//! declarations and can be split across several files that the build is
//! expected to stitch together. Preparation strips comments (preserving
//! line counts so diagnostics still point at the right place), harvests
//! `#pragma parameter` lines into the configuration, synthesizes
//! prototypes, and writes the results into the build folder with `#line`
//! directives and a do-not-edit banner.

use crate::context::Context;
use crate::libs::{self, Library, LibraryCatalog};
use anyhow::{bail, Context as _, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const SKETCH_EXTENSIONS: [&str; 2] = ["ino", "pde"];
const AUX_EXTENSIONS: [&str; 6] = ["c", "cpp", "cxx", "cc", "S", "h"];

const GENERATED_BANNER: &str = "/* ------------------------------------------------------------------\n\
                                \x20*  AUTOMATICALLY GENERATED FILE - DO NOT EDIT.\n\
                                \x20*  Edit the sketch source this file was generated from instead.\n\
                                \x20* ------------------------------------------------------------------ */\n";

pub struct Sketch {
    pub name: String,
    pub folder: PathBuf,
    pub build_folder: PathBuf,
    pub files: Vec<PathBuf>,
    /// Preprocessed (comment-stripped) file contents, keyed by source path.
    cleaned: HashMap<PathBuf, String>,
    pub imported: HashMap<String, Library>,
    pub ordered: Vec<String>,
}

impl Sketch {
    /// Load a sketch from its folder. The folder name names the sketch and
    /// its main file (`<name>.ino` or `<name>.pde`).
    pub fn load(folder: &Path) -> Result<Sketch> {
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut files = Vec::new();
        let entries = fs::read_dir(folder)
            .with_context(|| format!("Failed to open sketch folder {}", folder.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true)
            {
                continue;
            }
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_string()) else {
                continue;
            };
            if SKETCH_EXTENSIONS.contains(&ext.as_str()) || AUX_EXTENSIONS.contains(&ext.as_str())
            {
                files.push(path);
            }
        }
        files.sort();

        let sketch = Sketch {
            build_folder: folder.join("build"),
            name,
            folder: folder.to_path_buf(),
            files,
            cleaned: HashMap::new(),
            imported: HashMap::new(),
            ordered: Vec::new(),
        };

        if sketch.main_file().is_none() {
            bail!(
                "{} is not a sketch folder: no {}.ino or {}.pde found",
                folder.display(),
                sketch.name,
                sketch.name
            );
        }
        Ok(sketch)
    }

    pub fn main_file(&self) -> Option<PathBuf> {
        for ext in SKETCH_EXTENSIONS {
            let candidate = self.folder.join(format!("{}.{}", self.name, ext));
            if self.files.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn is_sketch_file(path: &Path) -> bool {
        path.extension()
            .map(|e| SKETCH_EXTENSIONS.contains(&e.to_string_lossy().as_ref()))
            .unwrap_or(false)
    }

    pub fn file_by_name(&self, name: &str) -> Option<&PathBuf> {
        self.files
            .iter()
            .find(|f| f.file_name().map(|n| n.to_string_lossy() == name).unwrap_or(false))
    }

    pub fn libraries_folder(&self) -> PathBuf {
        self.folder.join("libraries")
    }

    /// Strip comments from every file. Sketch files additionally get their
    /// lines trimmed; auxiliary files pass through untouched.
    pub fn clean_files(&mut self) -> Result<()> {
        self.cleaned.clear();
        for file in &self.files {
            let data = fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if Self::is_sketch_file(file) {
                let stripped = strip_comments(&data);
                let trimmed: String = stripped
                    .lines()
                    .map(|l| format!("{}\n", l.trim()))
                    .collect();
                self.cleaned.insert(file.clone(), trimmed);
            } else {
                self.cleaned.insert(file.clone(), data);
            }
        }
        Ok(())
    }

    /// Include names referenced by the cleaned files, in first-seen order.
    pub fn gather_includes(&self) -> Vec<String> {
        let include = Regex::new(r#"^#\s*include\s+[<"]([^>"]+)[>"]"#).unwrap();
        let mut out = Vec::new();
        for file in &self.files {
            let Some(data) = self.cleaned.get(file) else {
                continue;
            };
            for line in data.lines() {
                if let Some(caps) = include.captures(line.trim()) {
                    let name = caps[1].to_string();
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
        }
        out
    }

    /// Rebuild the imported-library closure from the current includes.
    pub fn update_library_list(&mut self, catalog: &LibraryCatalog) -> Result<()> {
        self.imported.clear();
        self.ordered.clear();
        let libs_folder = self.libraries_folder();
        let local = libs_folder.is_dir().then_some(libs_folder.as_path());
        for include in self.gather_includes() {
            libs::import_library(
                catalog,
                local,
                &mut self.imported,
                &mut self.ordered,
                &include,
            )?;
        }
        Ok(())
    }

    /// Diagnostic lookup: where would this include come from? The sketch's
    /// own files are never externally-resolvable libraries.
    pub fn find_library(&self, catalog: &LibraryCatalog, include: &str) -> Option<Library> {
        if self.file_by_name(include).is_some() {
            return None;
        }
        let name = libs::trim_include(include);
        let libs_folder = self.libraries_folder();
        if libs_folder.is_dir() {
            let folder = libs_folder.join(&name);
            if let Some(lib) = Library::discover(&folder, &name) {
                return Some(lib);
            }
        }
        catalog.find(&name).cloned()
    }

    /// Prepare sources into the build folder: optional multi-file
    /// combining, pragma harvesting, prototype synthesis, banner and
    /// `#line` bookkeeping. Pragma parameters land in the context's
    /// parameter layer.
    pub fn prepare(&mut self, ctx: &mut Context) -> Result<()> {
        let props = ctx.merged();
        let combine = props.get("compiler.combine_sketch") == Some("true");

        let mut prepared: Vec<(PathBuf, String)> = Vec::new();
        let mut sketch_texts: Vec<(PathBuf, String)> = Vec::new();
        for file in &self.files {
            let Some(data) = self.cleaned.get(file) else {
                continue;
            };
            if Self::is_sketch_file(file) {
                sketch_texts.push((file.clone(), data.clone()));
            } else {
                prepared.push((file.clone(), data.clone()));
            }
        }

        if combine {
            if let Some(main) = self.main_file() {
                let mut out = String::new();
                let main_name = file_name(&main);
                out.push_str(&format!("#line 1 \"{}\"\n", main_name));
                if let Some(pos) = sketch_texts.iter().position(|(f, _)| *f == main) {
                    out.push_str(&sketch_texts[pos].1);
                    sketch_texts.remove(pos);
                }
                for (file, data) in sketch_texts.drain(..) {
                    out.push_str(&format!("#line 1 \"{}\"\n", file_name(&file)));
                    out.push_str(&data);
                }
                sketch_texts.push((main, out));
            }
        }

        // Prototype synthesis and pragma harvesting for the sketch files.
        let pragma = Regex::new(r"^#pragma\s+parameter\s+([^=]+?)\s*=\s*(.*?)\s*$").unwrap();
        for (file, data) in sketch_texts {
            let fname = file_name(&file);
            let functions = find_functions(&data);
            let first_function = functions.first().cloned();

            let mut munged = String::new();
            let mut line = 1usize;
            let mut inserted = false;
            for l in data.lines() {
                if let (Some(first), false) = (&first_function, inserted) {
                    if l.trim().starts_with(first.as_str()) {
                        for func in &functions {
                            munged.push_str(func);
                            munged.push_str(";\n");
                        }
                        munged.push_str(&format!("#line {} \"{}\"\n", line, fname));
                        inserted = true;
                    }
                }
                if let Some(caps) = pragma.captures(l.trim()) {
                    ctx.parameters
                        .set(caps[1].trim(), munge_parameter(&caps[2]));
                    munged.push_str("// ");
                }
                munged.push_str(l);
                munged.push('\n');
                if !l.starts_with("#line 1 ") {
                    line += 1;
                }
            }
            prepared.push((file, munged));
        }

        // Write everything into the build folder.
        fs::create_dir_all(&self.build_folder)
            .with_context(|| format!("Failed to create {}", self.build_folder.display()))?;
        let extension = props.get("build.extension").unwrap_or("cpp").to_string();
        let core_header = props.get("core.header").map(String::from);

        for (file, data) in prepared {
            let fname = file_name(&file);
            let mut out = String::from(GENERATED_BANNER);
            if Self::is_sketch_file(&file) {
                if let Some(header) = &core_header {
                    out.push_str(&format!("#include <{}>\n", header));
                }
                if !combine {
                    out.push_str(&format!("#line 1 \"{}\"\n", fname));
                }
                out.push_str(&data);
                let stem = file.file_stem().unwrap_or_default().to_string_lossy();
                let target = self.build_folder.join(format!("{}.{}", stem, extension));
                fs::write(&target, out)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
            } else {
                out.push_str(&format!("#line 1 \"{}\"\n", fname));
                out.push_str(&data);
                let target = self.build_folder.join(&fname);
                fs::write(&target, out)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Strip `//` and `/* */` comments while preserving the line count, so
/// `#line` directives keep diagnostics honest.
pub fn strip_comments(data: &str) -> String {
    let mut out = String::new();

    // First the single-line forms.
    let mut intermediate = String::new();
    for line in data.lines() {
        let mut line = line.to_string();
        if let Some(pos) = line.find("//") {
            line.truncate(pos);
        }
        if let (Some(start), Some(end)) = (line.find("/*"), line.find("*/")) {
            if end > start {
                let tail = line[end + 2..].to_string();
                line.truncate(start);
                line.push_str(&tail);
            }
        }
        intermediate.push_str(&line);
        intermediate.push('\n');
    }

    // Multi-line comments keep their newlines.
    let mut in_comment = false;
    for line in intermediate.lines() {
        if !in_comment {
            if let Some(start) = line.find("/*") {
                out.push_str(&line[..start]);
                out.push('\n');
                in_comment = true;
                continue;
            }
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if let Some(end) = line.find("*/") {
            out.push_str(&line[end + 2..]);
            out.push('\n');
            in_comment = false;
            continue;
        }
        out.push('\n');
    }

    out
}

/// Find probable function definition lines: not preprocessor, not ending
/// in a semicolon, carrying a `type name(` shape outside of strings and
/// brace bodies.
pub fn find_functions(data: &str) -> Vec<String> {
    let unescaped = Regex::new(r"\\.").unwrap().replace_all(data, "");
    let no_chars = Regex::new(r"'[^'\n\r]*'").unwrap().replace_all(&unescaped, "");
    let no_strings = Regex::new(r#""[^"\n\r]*""#).unwrap().replace_all(&no_chars, "");
    let decimated = strip_block(&no_strings, '{', '}');

    let shape = Regex::new(r"[A-Za-z0-9_]+\s+[A-Za-z0-9_]+\s*\(").unwrap();
    let mut out = Vec::new();
    for line in decimated.lines() {
        let line = line.trim();
        if line.is_empty() || line.ends_with(';') || line.starts_with('#') {
            continue;
        }
        if !line.contains('(') {
            continue;
        }
        if shape.is_match(line) {
            out.push(line.to_string());
        }
    }
    out
}

/// Repeatedly remove innermost `start..end` blocks until none remain.
fn strip_block(data: &str, start: char, end: char) -> String {
    let pattern = format!("(?s)\\{}[^\\{}\\{}]*\\{}", start, start, end, end);
    let re = Regex::new(&pattern).unwrap();
    let mut out = data.to_string();
    loop {
        let next = re.replace_all(&out, "").into_owned();
        if next == out {
            return out;
        }
        out = next;
    }
}

/// Pragma parameter values keep quoted runs intact and turn separating
/// spaces into the `::` argument delimiter.
fn munge_parameter(value: &str) -> String {
    let mut out = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            ' ' => out.push_str("::"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_preserves_line_count() {
        let src = "int a; // trailing\n/* one\ntwo\nthree */\nint b;\n";
        let stripped = strip_comments(src);
        assert_eq!(stripped.lines().count(), src.lines().count());
        assert!(!stripped.contains("trailing"));
        assert!(!stripped.contains("two"));
        assert!(stripped.contains("int b;"));
    }

    #[test]
    fn test_find_functions_skips_prototypes_and_calls() {
        let src = "void setup();\nvoid setup() {\n  doThing();\n}\nint helper(int x) {\n  return x;\n}\n";
        let functions = find_functions(src);
        assert!(functions.iter().any(|f| f.starts_with("void setup()")));
        assert!(functions.iter().any(|f| f.starts_with("int helper(int x)")));
        assert!(!functions.iter().any(|f| f.contains("doThing")));
    }

    #[test]
    fn test_munge_parameter_quotes_and_spaces() {
        assert_eq!(munge_parameter("a b"), "a::b");
        assert_eq!(munge_parameter("say \"hello world\" now"), "say::\"hello world\"::now");
    }

    #[test]
    fn test_load_rejects_folder_without_main_file() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("thing");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("other.cpp"), "int x;\n").unwrap();
        assert!(Sketch::load(&folder).is_err());
    }

    #[test]
    fn test_gather_includes_in_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("blinky");
        fs::create_dir_all(&folder).unwrap();
        fs::write(
            folder.join("blinky.ino"),
            "#include <Wire.h>\n#include \"local.h\"\nvoid setup() {}\nvoid loop() {}\n",
        )
        .unwrap();

        let mut sketch = Sketch::load(&folder).unwrap();
        sketch.clean_files().unwrap();
        assert_eq!(sketch.gather_includes(), vec!["Wire.h", "local.h"]);
    }
}
