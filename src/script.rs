//! Scripted-command interpreter.
//!
//! Configuration can express control flow without a general-purpose
//! language: a "script" is a numbered family of keys (`upload.script.0`,
//! `upload.script.1`, ...) executed sequentially. Each expanded line is
//! either a control directive (`goto::N`, `set::k=v`, `fail`, `end`) or a
//! key to execute — which may itself name a nested script, a builtin, or
//! an external command. `<key>.fail` and `<key>.end` hooks run on the
//! corresponding terminal transitions.
//!
//! A key with no `.0` line is not a script; callers that care about the
//! distinction check [`has_script`] before dispatching.

use crate::builtin::BuiltinRegistry;
use crate::context::Context;
use crate::exec;
use crate::expand;
use crate::props::PropertyStore;
use anyhow::Result;

/// True when `key` defines a script (a line numbered 0 exists).
pub fn has_script(props: &PropertyStore, key: &str) -> bool {
    props.key_exists(&format!("{}.0", key))
}

/// Execute a key from the merged configuration: as a script when it has a
/// `.0` line, as a single command when it has a bare value, else `false`.
pub fn execute_key(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    key: &str,
    silent: bool,
) -> Result<bool> {
    let props = ctx.merged();
    let key = props.key_for_host(key);

    if has_script(&props, &key) {
        return run_script(ctx, builtins, &key, silent);
    }

    if let Some(value) = props.get(&key) {
        let command = expand::expand(ctx, value)?;
        let env = match props.get(&format!("{}.environment", key)) {
            Some(spec) => Some(expand::expand(ctx, spec)?),
            None => None,
        };
        return execute_command(ctx, builtins, &command, env.as_deref(), silent);
    }

    Ok(false)
}

/// Dispatch one resolved command string: builtins in-process, everything
/// else through the process runner.
pub fn execute_command(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    command: &str,
    env: Option<&str>,
    silent: bool,
) -> Result<bool> {
    if command.starts_with("__builtin_") {
        run_builtin(ctx, builtins, command, silent)
    } else {
        exec::run_command(ctx, command, env, silent)
    }
}

fn run_builtin(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    commandline: &str,
    silent: bool,
) -> Result<bool> {
    let mut parts = commandline.split("::");
    let name = parts
        .next()
        .unwrap_or_default()
        .trim_start_matches("__builtin_")
        .to_string();
    let args: Vec<String> = parts.map(String::from).collect();

    if ctx.verbose && !ctx.silence && !silent {
        let mut echo = name.clone();
        for arg in &args {
            echo.push(' ');
            echo.push_str(arg);
        }
        ctx.command(&echo);
    }

    builtins.run(ctx, &name, &args)
}

/// One decoded script line. Control directives are recognized on the raw
/// line text; the directive's payload is expanded at execution time.
enum Instr {
    Goto,
    Set,
    Fail,
    End,
    Execute,
}

impl Instr {
    fn decode(line: &str) -> Instr {
        if line.starts_with("goto::") {
            Instr::Goto
        } else if line.starts_with("set::") {
            Instr::Set
        } else if line == "fail" {
            Instr::Fail
        } else if line == "end" {
            Instr::End
        } else {
            Instr::Execute
        }
    }
}

fn run_script(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    key: &str,
    silent: bool,
) -> Result<bool> {
    // Line lookup runs against a snapshot; expansion and nested execution
    // always see the live merged view, so `set::` affects subsequent
    // recipe text but not the script's own line table.
    let props = ctx.merged();
    let script = props.children_of(key);

    let mut lineno: usize = 0;
    let mut res = false;

    while script.key_exists(&lineno.to_string()) {
        let line_key = props.key_for_host(&format!("{}.{}", key, lineno));
        let raw = props.get(&line_key).unwrap_or_default().trim().to_string();

        match Instr::decode(&raw) {
            Instr::Goto => {
                let expanded = expand::expand(ctx, &raw)?;
                match expanded[6..].trim().parse::<usize>() {
                    Ok(target) => {
                        lineno = target;
                        continue;
                    }
                    Err(_) => {
                        ctx.error(&format!("Syntax error in {} at line {}", key, lineno));
                        ctx.error(&expanded);
                        run_fail_hook(ctx, builtins, key, &script, silent)?;
                        return Ok(false);
                    }
                }
            }
            Instr::Set => {
                let expanded = expand::expand(ctx, &raw)?;
                match expanded[5..].split_once('=') {
                    Some((k, v)) => {
                        ctx.set(k, v);
                    }
                    None => {
                        ctx.error(&format!("Syntax error in {} at line {}", key, lineno));
                        ctx.error(&expanded);
                        run_fail_hook(ctx, builtins, key, &script, silent)?;
                        return Ok(false);
                    }
                }
            }
            Instr::Fail => {
                run_fail_hook(ctx, builtins, key, &script, silent)?;
                return Ok(false);
            }
            Instr::End => {
                if script.key_exists("end") {
                    res = execute_key(ctx, builtins, &format!("{}.end", key), silent)?;
                }
                return Ok(res);
            }
            Instr::Execute => {
                res = execute_key(ctx, builtins, &line_key, silent)?;
                if !res {
                    run_fail_hook(ctx, builtins, key, &script, silent)?;
                    return Ok(false);
                }
            }
        }

        lineno += 1;
    }

    if script.key_exists("end") {
        res = execute_key(ctx, builtins, &format!("{}.end", key), silent)?;
    }
    Ok(res)
}

fn run_fail_hook(
    ctx: &mut Context,
    builtins: &BuiltinRegistry,
    key: &str,
    script: &PropertyStore,
    silent: bool,
) -> Result<()> {
    if script.key_exists("fail") {
        execute_key(ctx, builtins, &format!("{}.fail", key), silent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::RecordingReporter;

    fn test_context() -> Context {
        Context::new(
            Box::new(RecordingReporter::default()),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_goto_skips_lines() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("job.0", "set::x=1");
        ctx.sketch_settings.set("job.1", "goto::3");
        ctx.sketch_settings.set("job.2", "set::x=2");
        ctx.sketch_settings.set("job.3", "end");

        let builtins = BuiltinRegistry::with_defaults();
        execute_key(&mut ctx, &builtins, "job", true).unwrap();
        assert_eq!(ctx.get("x"), Some("1"));
    }

    #[test]
    fn test_fail_line_runs_fail_hook_and_returns_false() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("job.0", "fail");
        ctx.sketch_settings.set("job.fail.0", "set::cleaned=yes");
        ctx.sketch_settings.set("job.fail.1", "end");

        let builtins = BuiltinRegistry::with_defaults();
        let result = execute_key(&mut ctx, &builtins, "job", true).unwrap();
        assert!(!result);
        assert_eq!(ctx.get("cleaned"), Some("yes"));
    }

    #[test]
    fn test_end_stops_before_later_lines() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("job.0", "set::a=first");
        ctx.sketch_settings.set("job.1", "end");
        ctx.sketch_settings.set("job.2", "set::a=second");

        let builtins = BuiltinRegistry::with_defaults();
        execute_key(&mut ctx, &builtins, "job", true).unwrap();
        assert_eq!(ctx.get("a"), Some("first"));
    }

    #[test]
    fn test_malformed_goto_fails_script() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("job.0", "goto::nowhere");

        let builtins = BuiltinRegistry::with_defaults();
        assert!(!execute_key(&mut ctx, &builtins, "job", true).unwrap());
    }

    #[test]
    fn test_set_value_is_expanded_before_assignment() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("mcu", "atmega328p");
        ctx.sketch_settings.set("job.0", "set::target=${mcu}");
        ctx.sketch_settings.set("job.1", "end");

        let builtins = BuiltinRegistry::with_defaults();
        execute_key(&mut ctx, &builtins, "job", true).unwrap();
        assert_eq!(ctx.get("target"), Some("atmega328p"));
    }

    #[test]
    fn test_builtin_line_executes_in_process() {
        let mut ctx = test_context();
        ctx.sketch_settings.set("job.0", "__builtin_echo::hello");
        ctx.sketch_settings.set("job.1", "end");

        let builtins = BuiltinRegistry::with_defaults();
        assert!(execute_key(&mut ctx, &builtins, "job", true).unwrap());
    }

    #[test]
    fn test_missing_key_is_not_a_script() {
        let ctx = test_context();
        assert!(!has_script(&ctx.merged(), "nothing.here"));
    }
}
