//! External tool invocation.
//!
//! Commands arrive as rendered text lines. The executor expands `%VAR%`
//! environment references, splits the line on whitespace outside double
//! quotes, spawns the tool with stderr merged into stdout, and reports the
//! exit code alongside the captured text.

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::process::{Command, Stdio};

/// Environment exported to spawned tools on top of the parent environment.
pub type EnvMap = HashMap<String, String>;

#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
    /// stdout and stderr interleaved, lossily decoded.
    pub text: String,
}

impl ExecOutput {
    pub fn success(&self, err_level: i32) -> bool {
        self.code <= err_level
    }
}

/// Replace `%NAME%` references with values from `env`. Unknown names are
/// left verbatim so tool-native `%...%` syntax survives.
pub fn expand_env(text: &str, env: &EnvMap) -> String {
    let mut out = text.to_string();
    for (key, value) in env {
        out = out.replace(&format!("%{}%", key), value);
    }
    out
}

/// Split a rendered command line into arguments. Double quotes group words
/// and are stripped; there is no escape syntax, matching how the rendered
/// lines quote paths.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Spawn a tool directly (no shell) with the rendered argument line.
pub fn run_tool(exe: &str, arg_line: &str, env: &EnvMap) -> Result<ExecOutput> {
    let exe = expand_env(exe, env);
    let args = split_command_line(&expand_env(arg_line, env));

    let output = Command::new(&exe)
        .args(&args)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to start '{}'", exe))?;

    Ok(merge_output(output))
}

/// Run a full command line through the platform shell. Post-link vendor
/// steps need this: their command templates use redirection.
pub fn run_shell(line: &str, env: &EnvMap) -> Result<ExecOutput> {
    let line = expand_env(line, env);

    #[cfg(windows)]
    let mut command = {
        let mut c = Command::new("cmd");
        c.args(["/C", &line]);
        c
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut c = Command::new("sh");
        c.args(["-c", &line]);
        c
    };

    let output = command
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to run '{}'", line))?;

    Ok(merge_output(output))
}

fn merge_output(output: std::process::Output) -> ExecOutput {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let err = String::from_utf8_lossy(&output.stderr);
    if !err.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&err);
    }
    ExecOutput {
        code: output.status.code().unwrap_or(-1),
        text,
    }
}

/// Resolve the toolchain root and make sure the tool executables exist
/// under it before any command runs.
pub fn check_tools(bin_dir: &std::path::Path, relative_tools: &[String]) -> Result<()> {
    if !bin_dir.is_dir() {
        return Err(anyhow!(
            "toolchain directory '{}' does not exist",
            bin_dir.display()
        ));
    }
    for rel in relative_tools {
        let mut path = bin_dir.join(rel);
        if !path.is_file() {
            path.set_extension("exe");
            if !path.is_file() {
                return Err(anyhow!(
                    "tool '{}' not found under '{}'",
                    rel,
                    bin_dir.display()
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_honors_quotes() {
        assert_eq!(
            split_command_line(r#"-o "/out dir/main.o" main.c"#),
            vec!["-o", "/out dir/main.o", "main.c"]
        );
        assert_eq!(split_command_line("  -c   -g  "), vec!["-c", "-g"]);
        assert_eq!(split_command_line(""), Vec::<String>::new());
    }

    #[test]
    fn test_expand_env() {
        let mut env = EnvMap::new();
        env.insert("TOOL_DIR".into(), "/opt/gcc".into());
        assert_eq!(
            expand_env("%TOOL_DIR%/bin/gcc -D%UNKNOWN%", &env),
            "/opt/gcc/bin/gcc -D%UNKNOWN%"
        );
    }

    #[test]
    fn test_err_level_threshold() {
        let warn = ExecOutput { code: 1, text: String::new() };
        assert!(!warn.success(0));
        assert!(warn.success(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_captures_output() {
        let out = run_shell("echo hello && echo oops 1>&2", &EnvMap::new()).unwrap();
        assert_eq!(out.code, 0);
        assert!(out.text.contains("hello"));
        assert!(out.text.contains("oops"));
    }
}
