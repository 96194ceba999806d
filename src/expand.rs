//! Recipe token expansion.
//!
//! Recipes pulled from the merged configuration contain `${...}`
//! placeholders: plain key lookups, path roots, or one of a small set of
//! pseudo-functions (`if:`, `replace:`, `foreach:`, `find:`, `verbose`,
//! `port`, `port.base`). Expansion is total — malformed bodies substitute
//! a literal diagnostic string instead of failing the build — except for
//! runaway self-referential expansion, which is cut off by a step budget
//! and reported as an error.
//!
//! Span matching follows the engine's historical scanning rule: the
//! closing brace is the nearest one after the first `${`, and any `${`
//! opening before that brace restarts the span there, so the last-opened
//! placeholder within an ambiguous run is resolved first.

use crate::context::Context;
use anyhow::{bail, Result};
use regex::Regex;
use std::path::Path;

/// Replacement-step budget per expansion. A recipe that keeps producing
/// new placeholders past this is cyclic.
const MAX_STEPS: usize = 500;

/// Expand every `${...}` placeholder in `text` against the context's
/// merged configuration. Missing keys resolve to the empty string, never
/// an error; the only failure is exceeding the step budget.
pub fn expand(ctx: &Context, text: &str) -> Result<String> {
    let mut out = text.to_string();
    let mut steps = 0;

    while let Some((start, end)) = find_span(&out) {
        steps += 1;
        if steps > MAX_STEPS {
            bail!(
                "Token expansion did not settle after {} replacements: {}",
                MAX_STEPS,
                out
            );
        }
        let body = &out[start + 2..end];
        let value = eval(ctx, body);
        out = format!("{}{}{}", &out[..start], value, &out[end + 1..]);
    }

    Ok(out)
}

/// Locate the next span to replace: `(index of "${", index of "}")`.
/// Returns `None` when no complete placeholder remains.
fn find_span(s: &str) -> Option<(usize, usize)> {
    let first = s.find("${")?;
    let end = s[first..].find('}').map(|i| i + first)?;

    let mut start = first;
    let mut probe = s[start + 1..].find("${").map(|i| i + start + 1);
    while let Some(later) = probe {
        if later >= end {
            break;
        }
        start = later;
        probe = s[start + 1..].find("${").map(|i| i + start + 1);
    }
    Some((start, end))
}

/// The recognized placeholder forms. Decoded once per span; anything with
/// a colon that is not a known function is `Unrecognized` rather than
/// falling through to a key lookup.
enum Func<'a> {
    If(&'a str),
    Replace(&'a str),
    Foreach(&'a str),
    Find(&'a str),
    Verbose,
    Port,
    PortBase,
    CompilerRoot,
    CoreRoot,
    BoardRoot,
    CacheRoot,
    Lookup(&'a str),
    Unrecognized(&'a str),
}

impl<'a> Func<'a> {
    fn decode(body: &'a str) -> Self {
        match body {
            "verbose" => return Func::Verbose,
            "port" => return Func::Port,
            "port.base" => return Func::PortBase,
            "compiler.root" => return Func::CompilerRoot,
            "core.root" => return Func::CoreRoot,
            "board.root" => return Func::BoardRoot,
            "cache.root" => return Func::CacheRoot,
            _ => {}
        }
        if let Some((name, param)) = body.split_once(':') {
            return match name {
                "if" => Func::If(param),
                "replace" => Func::Replace(param),
                "foreach" => Func::Foreach(param),
                "find" => Func::Find(param),
                _ => Func::Unrecognized(name),
            };
        }
        Func::Lookup(body)
    }
}

fn eval(ctx: &Context, body: &str) -> String {
    match Func::decode(body) {
        Func::If(param) => eval_if(param),
        Func::Replace(param) => eval_replace(param),
        Func::Foreach(param) => eval_foreach(param),
        Func::Find(param) => eval_find(param),
        Func::Verbose => eval_verbose(ctx),
        Func::Port => eval_port(ctx),
        Func::PortBase => eval_port_base(ctx),
        Func::CompilerRoot => bundle_root(ctx.compiler.as_ref().map(|b| b.root.as_path())),
        Func::CoreRoot => bundle_root(ctx.core.as_ref().map(|b| b.root.as_path())),
        Func::BoardRoot => bundle_root(ctx.board.as_ref().map(|b| b.root.as_path())),
        Func::CacheRoot => ctx
            .cache_folder()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        Func::Lookup(key) => ctx.merged_get(key).unwrap_or_default(),
        Func::Unrecognized(name) => format!("Unknown function '{}'", name),
    }
}

fn bundle_root(root: Option<&Path>) -> String {
    root.map(|p| p.display().to_string()).unwrap_or_default()
}

/// `if:left=right,trueVal[,falseVal]` — exact string comparison.
fn eval_if(param: &str) -> String {
    let bits: Vec<&str> = param.split(',').collect();
    if bits.len() < 2 || bits.len() > 3 {
        return "Syntax Error in if - bad arg count".to_string();
    }
    let cond: Vec<&str> = bits[0].split('=').collect();
    if cond.len() != 2 {
        return "Syntax Error in if - bad comparison".to_string();
    }
    if cond[0].trim() == cond[1].trim() {
        bits[1].to_string()
    } else if bits.len() == 3 {
        bits[2].to_string()
    } else {
        String::new()
    }
}

/// `replace:input,pattern,replacement` — regex replace-all.
fn eval_replace(param: &str) -> String {
    let bits: Vec<&str> = param.split(',').collect();
    if bits.len() != 3 {
        return "Syntax error in replace - bad arg count".to_string();
    }
    match Regex::new(bits[1]) {
        Ok(re) => re.replace_all(bits[0], bits[2]).into_owned(),
        Err(_) => "Syntax error in replace - bad pattern".to_string(),
    }
}

/// `foreach:a::b::c,format-with-%0` — apply the format to each element,
/// rejoin with `::`.
fn eval_foreach(param: &str) -> String {
    let Some((data, format)) = param.split_once(',') else {
        return "Syntax Error in foreach".to_string();
    };
    data.split("::")
        .map(|chunk| format.replace("%0", chunk))
        .collect::<Vec<_>>()
        .join("::")
}

/// `find:dir1::dir2,filename` — absolute path of the file in the first
/// directory that contains it; the body itself if nothing does.
fn eval_find(param: &str) -> String {
    let Some((paths, fname)) = param.split_once(',') else {
        return "Syntax Error in find".to_string();
    };
    for dir in paths.split("::") {
        let dir = Path::new(dir);
        if dir.is_dir() {
            let candidate = dir.join(fname);
            if candidate.exists() {
                return candidate.display().to_string();
            }
        }
    }
    format!("find:{}", param)
}

/// The verbose or quiet variant of the selected programmer's message.
fn eval_verbose(ctx: &Context) -> String {
    let programmer = match &ctx.programmer {
        Some(p) => p.name.clone(),
        None => return String::new(),
    };
    let key = if ctx.verbose {
        format!("upload.{}.verbose", programmer)
    } else {
        format!("upload.{}.quiet", programmer)
    };
    ctx.merged_get(&key).unwrap_or_default()
}

fn eval_port(ctx: &Context) -> String {
    let port = ctx.port.clone().unwrap_or_default();
    if cfg!(windows) {
        format!("\\\\.\\{}", port)
    } else {
        port
    }
}

fn eval_port_base(ctx: &Context) -> String {
    let port = ctx.port.clone().unwrap_or_default();
    if cfg!(windows) {
        port
    } else {
        port.rsplit('/').next().unwrap_or(&port).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::RecordingReporter;

    fn test_context() -> Context {
        let mut ctx = Context::new(
            Box::new(RecordingReporter::default()),
            std::env::temp_dir(),
        );
        ctx.set("name", "blinky");
        ctx.set("greeting", "hello ${name}");
        ctx.set("mcu", "atmega328p");
        ctx
    }

    #[test]
    fn test_plain_lookup_and_missing_key() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "-mmcu=${mcu}").unwrap(), "-mmcu=atmega328p");
        assert_eq!(expand(&ctx, "x${no.such.key}y").unwrap(), "xy");
    }

    #[test]
    fn test_nested_placeholder_resolves_innermost_first() {
        let mut ctx = test_context();
        ctx.set("which", "mcu");
        assert_eq!(expand(&ctx, "${${which}}").unwrap(), "atmega328p");
    }

    #[test]
    fn test_value_containing_placeholder_is_re_expanded() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "${greeting}!").unwrap(), "hello blinky!");
    }

    #[test]
    fn test_expansion_is_idempotent_on_expanded_text() {
        let ctx = test_context();
        let once = expand(&ctx, "gcc -mmcu=${mcu} ${if:a=a,-Os}").unwrap();
        assert_eq!(expand(&ctx, &once).unwrap(), once);
    }

    #[test]
    fn test_if_cases() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "${if:a=a,YES,NO}").unwrap(), "YES");
        assert_eq!(expand(&ctx, "${if:a=b,YES,NO}").unwrap(), "NO");
        assert_eq!(expand(&ctx, "${if:a=b,YES}").unwrap(), "");
        assert_eq!(
            expand(&ctx, "${if:oops,YES,NO,EXTRA}").unwrap(),
            "Syntax Error in if - bad arg count"
        );
    }

    #[test]
    fn test_foreach_formats_each_element() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "${foreach:x::y::z,<%0>}").unwrap(), "<x>::<y>::<z>");
    }

    #[test]
    fn test_replace_is_regex_replace_all() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "${replace:a-b-c,-,_}").unwrap(), "a_b_c");
    }

    #[test]
    fn test_unrecognized_function_yields_diagnostic() {
        let ctx = test_context();
        assert_eq!(
            expand(&ctx, "${frobnicate:x}").unwrap(),
            "Unknown function 'frobnicate'"
        );
    }

    #[test]
    fn test_unterminated_placeholder_left_alone() {
        let ctx = test_context();
        assert_eq!(expand(&ctx, "broken ${mcu").unwrap(), "broken ${mcu");
    }

    #[test]
    fn test_cyclic_expansion_hits_step_budget() {
        let mut ctx = test_context();
        ctx.set("a", "${b}");
        ctx.set("b", "${a}");
        assert!(expand(&ctx, "${a}").is_err());
    }

    #[test]
    fn test_find_missing_leaves_literal_body() {
        let ctx = test_context();
        let out = expand(&ctx, "${find:/nonexistent-dir,header.h}").unwrap();
        assert_eq!(out, "find:/nonexistent-dir,header.h");
    }
}
