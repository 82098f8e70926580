//! Shell command execution for switch and NIC programming.
//!
//! Open vSwitch is driven through `ovs-vsctl` / `ovs-ofctl` and SR-IOV
//! mirroring through sysfs writes; both go through [`exec`] with every
//! caller-provided argument wrapped by [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use taas_common::shell::{self, OVS_OFCTL_CMD, shellquote};
//!
//! let cmd = format!("{} dump-flows {} table=0", OVS_OFCTL_CMD, shellquote("br-int"));
//! let flows = shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{TaasError, TaasResult};

/// Path to `ovs-vsctl` (OVSDB: bridges, ports, interfaces).
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to `ovs-ofctl` (OpenFlow rules).
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Path to the `echo` command used for sysfs writes.
pub const ECHO_CMD: &str = "/bin/echo";

/// Characters that need escaping inside shell double quotes:
/// `$`, `` ` ``, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// # Example
///
/// ```
/// use taas_common::shell::shellquote;
///
/// assert_eq!(shellquote("br-int"), "\"br-int\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout output.
    pub stdout: String,
    /// Trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Executes a command through `/bin/sh -c`.
///
/// A non-zero exit is not an error here; see [`exec_or_throw`].
pub async fn exec(cmd: &str) -> TaasResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TaasError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a command and turns a non-zero exit into
/// [`TaasError::ShellCommandFailed`]. Returns stdout on success.
pub async fn exec_or_throw(cmd: &str) -> TaasResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(TaasError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_plain() {
        assert_eq!(shellquote("br-tap"), "\"br-tap\"");
        assert_eq!(shellquote("table=0,priority=20"), "\"table=0,priority=20\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`id`"), "\"\\`id\\`\"");
        assert_eq!(shellquote("a\"b"), "\"a\\\"b\"");
        assert_eq!(shellquote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_shellquote_injection() {
        let quoted = shellquote("tap0; rm -rf /");
        assert_eq!(quoted, "\"tap0; rm -rf /\"");
    }

    #[test]
    fn test_combined_output() {
        let both = ExecResult {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert!(!both.success());
        assert_eq!(both.combined_output(), "out\nerr");

        let only_err = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "err".to_string(),
        };
        assert_eq!(only_err.combined_output(), "err");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo mirror").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "mirror");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        match exec_or_throw("exit 3").await {
            Err(TaasError::ShellCommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }
}
