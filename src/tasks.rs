//! Pre/post build shell hooks.

use crate::exec::{self, EnvMap};
use crate::params::TaskHook;
use anyhow::{Result, anyhow};
use colored::Colorize;
use regex::Regex;

/// Values substituted into hook command lines. Tokens are written
/// `${TargetName}` and match case-insensitively.
pub struct TaskEnv {
    pairs: Vec<(&'static str, String)>,
    env: EnvMap,
}

impl TaskEnv {
    pub fn new(
        target_name: &str,
        out_dir: &str,
        tool_dir: &str,
        tool_prefix: &str,
        env: EnvMap,
    ) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.to_string_lossy().into_owned()))
            .unwrap_or_default();

        TaskEnv {
            pairs: vec![
                ("TargetName", target_name.to_string()),
                ("OutDir", out_dir.to_string()),
                ("ToolDir", tool_dir.to_string()),
                ("CompileToolDir", tool_dir.to_string()),
                ("ExeDir", exe_dir),
                ("toolPrefix", tool_prefix.to_string()),
            ],
            env,
        }
    }

    fn expand(&self, command: &str) -> String {
        let mut out = command.to_string();
        for (token, value) in &self.pairs {
            let pattern = Regex::new(&format!(r"(?i)\$\{{{}\}}", regex::escape(token))).unwrap();
            out = pattern.replace_all(&out, value.as_str()).into_owned();
        }
        out
    }
}

/// Run a hook list in order, honoring the per-hook failure policy:
/// `stopBuildAfterFailed` fails the build, `abortAfterFailed` stops the
/// remaining hooks, the default reports and carries on.
pub fn run_hooks(label: &str, hooks: &[TaskHook], task_env: &TaskEnv) -> Result<()> {
    let active: Vec<&TaskHook> = hooks.iter().filter(|h| !h.disable).collect();
    if active.is_empty() {
        return Ok(());
    }

    println!("{} {} tasks", ">>".cyan().bold(), label);
    for hook in active {
        let command = task_env.expand(&hook.command);
        let result = exec::run_shell(&command, &task_env.env)?;

        if result.code == 0 {
            println!("  {} {}", "✓".green(), hook.name);
            continue;
        }

        println!("  {} {} (exit code {})", "✗".red(), hook.name, result.code);
        if !result.text.is_empty() {
            println!("{}", result.text.trim_end());
        }
        if hook.stop_build_after_failed {
            return Err(anyhow!("{} task '{}' failed", label, hook.name));
        }
        if hook.abort_after_failed {
            println!("  {} remaining {} tasks skipped", "!".yellow(), label);
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_env() -> TaskEnv {
        TaskEnv {
            pairs: vec![
                ("TargetName", "app".to_string()),
                ("OutDir", "/proj/build".to_string()),
                ("ToolDir", "/opt/gcc".to_string()),
            ],
            env: EnvMap::new(),
        }
    }

    #[test]
    fn test_token_expansion_is_case_insensitive() {
        let env = task_env();
        assert_eq!(
            env.expand("cp ${targetname}.bin ${OUTDIR}/"),
            "cp app.bin /proj/build/"
        );
        assert_eq!(env.expand("${ToolDir}/bin/size"), "/opt/gcc/bin/size");
    }

    #[test]
    fn test_unknown_tokens_left_alone() {
        let env = task_env();
        assert_eq!(env.expand("echo ${Mystery}"), "echo ${Mystery}");
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_build_policy() {
        let hooks = vec![TaskHook {
            name: "always fails".into(),
            command: "exit 3".into(),
            disable: false,
            stop_build_after_failed: true,
            abort_after_failed: false,
        }];
        let err = run_hooks("before-build", &hooks, &task_env()).unwrap_err();
        assert!(err.to_string().contains("always fails"));
    }

    #[cfg(unix)]
    #[test]
    fn test_disabled_and_tolerated_failures() {
        let hooks = vec![
            TaskHook {
                name: "disabled".into(),
                command: "exit 1".into(),
                disable: true,
                stop_build_after_failed: true,
                abort_after_failed: false,
            },
            TaskHook {
                name: "tolerated".into(),
                command: "exit 1".into(),
                disable: false,
                stop_build_after_failed: false,
                abort_after_failed: false,
            },
        ];
        assert!(run_hooks("after-build", &hooks, &task_env()).is_ok());
    }
}
