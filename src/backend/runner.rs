//! Type-safe tool execution.
//!
//! `run_tool_safe` is the only way the engine spawns storage tools. It puts
//! each tool in its own process group, registers its PID for cleanup and
//! feeds typed arguments from a `ToolArgs` implementation.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use super::tools::ToolArgs;
use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// Program path for `name`: inside `tool_dir` when one is configured,
/// otherwise the bare name for `PATH` lookup.
pub fn resolve_program(name: &str, tool_dir: Option<&Path>) -> String {
    match tool_dir {
        Some(dir) => dir.join(name).display().to_string(),
        None => name.to_string(),
    }
}

/// Execute a storage tool with type-safe arguments.
///
/// A non-zero exit is not an error here; check `ToolOutput::success` or call
/// `ensure_success`.
///
/// # Errors
///
/// Spawning, feeding stdin or waiting for the tool failed.
pub fn run_tool_safe<T: ToolArgs + ?Sized>(args: &T, tool_dir: Option<&Path>) -> Result<ToolOutput> {
    let program = resolve_program(args.tool_name(), tool_dir);
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();
    let stdin = args.stdin();

    info!(program = %program, args = ?cli_args, "run_tool_safe");

    let mut cmd = Command::new(&program);
    cmd.args(&cli_args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn tool: {}", program))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    // The child is reaped and unregistered even when feeding it fails.
    let fed = match (stdin, child.stdin.take()) {
        (Some(script), Some(mut pipe)) => {
            debug!(program = %program, script = %script.trim_end(), "feeding stdin");
            pipe.write_all(script.as_bytes())
                .with_context(|| format!("Failed to write stdin of {}", program))
        }
        _ => Ok(()),
    };

    let output = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    fed?;
    let output = output.with_context(|| format!("Failed waiting for tool: {}", program))?;

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!(program = %program, "tool finished");
    } else {
        warn!(
            program = %program,
            exit_code = result.exit_code.unwrap_or(-1),
            "tool failed"
        );
    }
    Ok(result)
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ToolOutput {
    /// Check if the tool succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Sh(&'static str);

    impl ToolArgs for Sh {
        fn to_cli_args(&self) -> Vec<String> {
            vec!["-c".to_string(), self.0.to_string()]
        }

        fn tool_name(&self) -> &'static str {
            "sh"
        }
    }

    struct Cat(String);

    impl ToolArgs for Cat {
        fn to_cli_args(&self) -> Vec<String> {
            Vec::new()
        }

        fn tool_name(&self) -> &'static str {
            "cat"
        }

        fn stdin(&self) -> Option<String> {
            Some(self.0.clone())
        }
    }

    /// `sh -c script` fed with `input`.
    struct ShWithInput {
        script: String,
        input: String,
    }

    impl ToolArgs for ShWithInput {
        fn to_cli_args(&self) -> Vec<String> {
            vec!["-c".to_string(), self.script.clone()]
        }

        fn tool_name(&self) -> &'static str {
            "sh"
        }

        fn stdin(&self) -> Option<String> {
            Some(self.input.clone())
        }
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("sfdisk", None), "sfdisk");
        let dir = PathBuf::from("/opt/tools");
        assert_eq!(resolve_program("sfdisk", Some(&dir)), "/opt/tools/sfdisk");
    }

    #[test]
    fn test_captures_output_and_locale() {
        let output = run_tool_safe(&Sh("echo $LC_ALL; echo oops >&2"), None).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "C");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(output.ensure_success("sh").is_ok());
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        let output = run_tool_safe(&Sh("echo broken >&2; exit 3"), None).unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        let err = output.ensure_success("sfdisk").unwrap_err();
        assert_eq!(err.to_string(), "sfdisk failed (exit code 3): broken");
    }

    #[test]
    fn test_stdin_is_fed() {
        let output = run_tool_safe(&Cat("start=2048, size=4096\n".into()), None).unwrap();
        assert_eq!(output.stdout, "start=2048, size=4096\n");
    }

    #[test]
    fn test_closed_stdin_still_reaps_the_tool() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        // Larger than a pipe buffer, so the write cannot complete.
        let args = ShWithInput {
            script: format!("echo $$ > {}; exec 0<&-; sleep 0.2", pid_file.display()),
            input: "x".repeat(1 << 20),
        };

        let err = run_tool_safe(&args, None).unwrap_err();
        assert!(err.to_string().contains("Failed to write stdin of sh"));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!ChildRegistry::global().lock().unwrap().contains(pid));
        // A reaped child leaves no zombie entry behind.
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(run_tool_safe(&Sh("true"), Some(dir.path())).is_err());
    }
}
