//! Layered property store.
//!
//! Every target bundle (board, core, compiler, programmer) and every
//! per-sketch settings layer is a flat map of dotted keys to strings.
//! Stores merge in a fixed precedence order to form the effective view a
//! build runs against; later sources always win.
//!
//! Keys may carry a host-OS qualifier (`key.linux`, `key.macos`,
//! `key.windows`) which shadows the bare key on that platform.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Ordered map of dotted string keys to string values.
///
/// Insertion order is preserved so that child iteration and merging are
/// stable across runs.
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    order: Vec<String>,
    values: HashMap<String, String>,
}

fn host_suffix() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the definition-file grammar: `key=value` lines, `#` comments,
    /// blank lines ignored. Lines without `=` are skipped.
    pub fn parse(text: &str) -> Self {
        let mut store = Self::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                store.set(key.trim(), value.trim());
            }
        }
        store
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read properties from {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value.into());
    }

    pub fn key_exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// The host-qualified variant of `key` if one exists, otherwise `key`
    /// itself. `compile.c.windows` shadows `compile.c` on Windows.
    pub fn key_for_host(&self, key: &str) -> String {
        let qualified = format!("{}.{}", key, host_suffix());
        if self.values.contains_key(&qualified) {
            qualified
        } else {
            key.to_string()
        }
    }

    /// Lookup honoring host-qualified shadowing.
    pub fn get_for_host(&self, key: &str) -> Option<&str> {
        self.get(&self.key_for_host(key))
    }

    /// Unique immediate child segments under `prefix.`, in first-seen order.
    ///
    /// With keys `compiler.library.spi` and `compiler.library.wire.extra`,
    /// `child_keys_of("compiler.library")` yields `["spi", "wire"]`.
    pub fn child_keys_of(&self, prefix: &str) -> Vec<String> {
        let full = format!("{}.", prefix);
        let mut seen = Vec::new();
        for key in &self.order {
            if let Some(rest) = key.strip_prefix(&full) {
                let segment = rest.split('.').next().unwrap_or(rest);
                if !seen.iter().any(|s| s == segment) {
                    seen.push(segment.to_string());
                }
            }
        }
        seen
    }

    /// Sub-view of every key under `prefix.`, with the prefix stripped.
    pub fn children_of(&self, prefix: &str) -> PropertyStore {
        let full = format!("{}.", prefix);
        let mut out = PropertyStore::new();
        for key in &self.order {
            if let Some(rest) = key.strip_prefix(&full) {
                out.set(rest, self.values[key].clone());
            }
        }
        out
    }

    /// Copy every entry of `source` into this store; existing keys are
    /// overwritten, novel keys keep the source's order.
    pub fn merge(&mut self, source: &PropertyStore) {
        for key in &source.order {
            self.set(key.clone(), source.values[key].clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let store = PropertyStore::parse("# header\n\ncompile.c=gcc -c\nbad line\nname=uno\n");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("compile.c"), Some("gcc -c"));
        assert_eq!(store.get("name"), Some("uno"));
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base = PropertyStore::parse("a=1\nb=2\n");
        let over = PropertyStore::parse("b=3\nc=4\n");
        base.merge(&over);
        assert_eq!(base.get("a"), Some("1"));
        assert_eq!(base.get("b"), Some("3"));
        assert_eq!(base.get("c"), Some("4"));
    }

    #[test]
    fn test_child_keys_of_unique_in_order() {
        let store =
            PropertyStore::parse("core.library.api=1\ncore.library.spi.path=2\ncore.library.api.extra=3\n");
        assert_eq!(store.child_keys_of("core.library"), vec!["api", "spi"]);
    }

    #[test]
    fn test_children_of_strips_prefix() {
        let store = PropertyStore::parse("script.0=echo\nscript.1=end\nscript.fail=bail\nother=x\n");
        let sub = store.children_of("script");
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.get("0"), Some("echo"));
        assert_eq!(sub.get("fail"), Some("bail"));
        assert!(!sub.key_exists("other"));
    }

    #[test]
    fn test_host_qualified_key_shadows_bare() {
        let mut store = PropertyStore::new();
        store.set("upload.cmd", "generic");
        store.set(format!("upload.cmd.{}", super::host_suffix()), "host");
        assert_eq!(store.key_for_host("upload.cmd"), format!("upload.cmd.{}", super::host_suffix()));
        assert_eq!(store.get_for_host("upload.cmd"), Some("host"));
        assert_eq!(store.get_for_host("missing"), None);
    }
}
