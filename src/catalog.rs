//! Installed-target catalog.
//!
//! Boards, cores, compilers and programmers are independently installed
//! bundles: a folder carrying a definition file (`board.txt`, `core.txt`,
//! `compiler.txt`, `programmer.txt`) that loads into a [`PropertyStore`].
//! The catalog scans the installation roots once and hands bundles out by
//! name; it is passed into build contexts explicitly so tests can inject a
//! synthetic one.

use crate::props::PropertyStore;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    Board,
    Core,
    Compiler,
    Programmer,
}

impl BundleKind {
    pub fn definition_file(&self) -> &'static str {
        match self {
            BundleKind::Board => "board.txt",
            BundleKind::Core => "core.txt",
            BundleKind::Compiler => "compiler.txt",
            BundleKind::Programmer => "programmer.txt",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            BundleKind::Board => "boards",
            BundleKind::Core => "cores",
            BundleKind::Compiler => "compilers",
            BundleKind::Programmer => "programmers",
        }
    }
}

/// One installed board/core/compiler/programmer: its folder plus the
/// properties loaded from the definition file.
#[derive(Debug, Clone)]
pub struct TargetBundle {
    pub name: String,
    pub root: PathBuf,
    pub props: PropertyStore,
}

impl TargetBundle {
    /// Load a bundle from its folder. The display name comes from the
    /// `name` key when present, else the folder name.
    pub fn load(kind: BundleKind, folder: &Path) -> Result<Self> {
        let def = folder.join(kind.definition_file());
        if !def.exists() {
            bail!(
                "{} has no {} definition file",
                folder.display(),
                kind.definition_file()
            );
        }
        let props = PropertyStore::load(&def)?;
        let name = props
            .get("name")
            .map(String::from)
            .or_else(|| folder.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Ok(Self {
            name,
            root: folder.to_path_buf(),
            props,
        })
    }
}

/// All installed bundles, scanned from an installation root laid out as
/// `<root>/boards/<name>/board.txt` and so on for the other kinds.
#[derive(Debug, Default)]
pub struct Catalog {
    boards: HashMap<String, TargetBundle>,
    cores: HashMap<String, TargetBundle>,
    compilers: HashMap<String, TargetBundle>,
    programmers: HashMap<String, TargetBundle>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(root: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        for kind in [
            BundleKind::Board,
            BundleKind::Core,
            BundleKind::Compiler,
            BundleKind::Programmer,
        ] {
            let dir = root.join(kind.plural());
            if !dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to scan {}", dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if !path.join(kind.definition_file()).exists() {
                    continue;
                }
                match TargetBundle::load(kind, &path) {
                    Ok(bundle) => catalog.insert(kind, bundle),
                    Err(_) => continue,
                }
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, kind: BundleKind, bundle: TargetBundle) {
        self.map_mut(kind).insert(bundle.name.clone(), bundle);
    }

    pub fn get(&self, kind: BundleKind, name: &str) -> Option<&TargetBundle> {
        self.map(kind).get(name)
    }

    pub fn names(&self, kind: BundleKind) -> Vec<&str> {
        let mut names: Vec<&str> = self.map(kind).keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn map(&self, kind: BundleKind) -> &HashMap<String, TargetBundle> {
        match kind {
            BundleKind::Board => &self.boards,
            BundleKind::Core => &self.cores,
            BundleKind::Compiler => &self.compilers,
            BundleKind::Programmer => &self.programmers,
        }
    }

    fn map_mut(&mut self, kind: BundleKind) -> &mut HashMap<String, TargetBundle> {
        match kind {
            BundleKind::Board => &mut self.boards,
            BundleKind::Core => &mut self.cores,
            BundleKind::Compiler => &mut self.compilers,
            BundleKind::Programmer => &mut self.programmers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_name_prefers_name_key() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("uno");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("board.txt"), "name=Arduino Uno\nbuild.mcu=atmega328p\n").unwrap();

        let bundle = TargetBundle::load(BundleKind::Board, &folder).unwrap();
        assert_eq!(bundle.name, "Arduino Uno");
        assert_eq!(bundle.props.get("build.mcu"), Some("atmega328p"));
    }

    #[test]
    fn test_scan_skips_folders_without_definition() {
        let dir = tempfile::tempdir().unwrap();
        let boards = dir.path().join("boards");
        fs::create_dir_all(boards.join("uno")).unwrap();
        fs::create_dir_all(boards.join("junk")).unwrap();
        fs::write(boards.join("uno").join("board.txt"), "name=uno\n").unwrap();

        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(catalog.get(BundleKind::Board, "uno").is_some());
        assert_eq!(catalog.names(BundleKind::Board), vec!["uno"]);
    }
}
