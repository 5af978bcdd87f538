//! External hook execution.
//!
//! Operators drop executables into a hooks directory; agents invoke them at
//! well-known moments (`idle_server_check`, `preflight_snapshot`, …).
//! Parameters are passed as `--key=value` flags, output is captured, and
//! the exit status is mapped into [`HookResult`] with sentinel codes for
//! the cases where the hook never ran.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use oxherd_errors::{OxherdError, OxherdResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

/// Hook succeeded.
pub const HOOK_SUCCESS: i32 = 0;
/// The hook executable is not present; a success in optional mode.
pub const HOOK_DOES_NOT_EXIST: i32 = -1;
/// The hook is present but could not be inspected.
pub const HOOK_STAT_FAILED: i32 = -2;
/// The hook ran but its exit status could not be determined.
pub const HOOK_CANNOT_GET_EXIT_STATUS: i32 = -3;

/// A named external helper plus its `--key=value` parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hook {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
}

/// Outcome of a hook invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookResult {
    /// 0 on success; negative sentinels when the hook never ran.
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Hook {
    pub fn new(name: impl Into<String>, parameters: BTreeMap<String, String>) -> Self {
        Hook {
            name: name.into(),
            parameters,
        }
    }

    pub fn new_simple(name: impl Into<String>) -> Self {
        Hook::new(name, BTreeMap::new())
    }

    fn flags(&self) -> Vec<String> {
        self.parameters
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    format!("--{key}")
                } else {
                    format!("--{key}={value}")
                }
            })
            .collect()
    }

    /// Run the hook from `hooks_dir` and capture its outcome. Never errors
    /// on a nonzero exit; that is reported through
    /// [`HookResult::exit_status`].
    pub async fn execute(&self, hooks_dir: &Path) -> HookResult {
        let mut result = HookResult::default();

        let hook_path: PathBuf = hooks_dir.join(&self.name);
        match tokio::fs::metadata(&hook_path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                result.exit_status = HOOK_DOES_NOT_EXIST;
                result.stdout = format!("Skipping missing hook: {}\n", hook_path.display());
                return result;
            }
            Err(e) => {
                result.exit_status = HOOK_STAT_FAILED;
                result.stderr = format!("Cannot stat hook: {}: {e}\n", hook_path.display());
                return result;
            }
            Ok(_) => {}
        }

        let args = self.flags();
        info!(hook = %hook_path.display(), ?args, "executing hook");
        match Command::new(&hook_path).args(&args).output().await {
            Ok(output) => {
                result.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                result.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                result.exit_status = output
                    .status
                    .code()
                    .unwrap_or(HOOK_CANNOT_GET_EXIT_STATUS);
            }
            Err(e) => {
                result.exit_status = HOOK_CANNOT_GET_EXIT_STATUS;
                result.stderr = format!("ERROR: {e}\n");
            }
        }
        result
    }

    /// Run the hook, treating a missing executable as success and any other
    /// failure as an error.
    pub async fn execute_optional(&self, hooks_dir: &Path) -> OxherdResult<()> {
        let result = self.execute(hooks_dir).await;
        match result.exit_status {
            HOOK_DOES_NOT_EXIST => {
                info!(hook = %self.name, "hook not present, skipping");
                Ok(())
            }
            HOOK_SUCCESS => Ok(()),
            status => Err(OxherdError::HookFailed(format!(
                "{} exited with {status}: {}{}",
                self.name, result.stdout, result.stderr
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    async fn write_hook(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
    }

    #[tokio::test]
    async fn missing_hook_is_sentinel_and_optional_success() {
        let dir = tempfile::tempdir().unwrap();
        let hook = Hook::new_simple("no_such_hook");
        let result = hook.execute(dir.path()).await;
        assert_eq!(result.exit_status, HOOK_DOES_NOT_EXIST);
        hook.execute_optional(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn hook_args_and_output_captured() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "echo_check", "#!/bin/sh\necho \"args: $@\"\n").await;

        let mut params = BTreeMap::new();
        params.insert("keyspace".to_string(), "test".to_string());
        params.insert("force".to_string(), String::new());
        let result = Hook::new("echo_check", params).execute(dir.path()).await;
        assert_eq!(result.exit_status, HOOK_SUCCESS);
        assert_eq!(result.stdout, "args: --force --keyspace=test\n");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_optional_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "failing", "#!/bin/sh\necho nope >&2\nexit 3\n").await;

        let hook = Hook::new_simple("failing");
        let result = hook.execute(dir.path()).await;
        assert_eq!(result.exit_status, 3);
        assert!(result.stderr.contains("nope"));
        assert!(matches!(
            hook.execute_optional(dir.path()).await,
            Err(OxherdError::HookFailed(_))
        ));
    }
}
