//! External command execution.

use crate::errors::SchedulerError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true on exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Rejected`] if the command failed.
    pub fn into_result(self) -> Result<Self, SchedulerError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SchedulerError::Rejected {
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs a command to completion, capturing its output.
///
/// # Errors
///
/// Returns [`SchedulerError::Spawn`] if the program cannot be started. A
/// non-zero exit is not an error here.
pub async fn run_command<I, S>(
    program: impl AsRef<Path>,
    args: I,
    env: &[(String, String)],
) -> Result<CommandOutput, SchedulerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program.display(), "Running command");
    let output = cmd.output().await.map_err(|source| SchedulerError::Spawn {
        program: program.display().to_string(),
        source,
    })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quotes a word for a POSIX shell.
pub(crate) fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+%@".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let env = vec![("SDMFLOW_TEST".to_string(), "value".to_string())];
        let out = run_command("sh", ["-c", "echo $SDMFLOW_TEST; echo oops >&2; exit 3"], &env)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "value");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.code, Some(3));
        assert!(matches!(
            out.into_result(),
            Err(SchedulerError::Rejected { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = run_command("/nonexistent/sdmflow-test", Vec::<String>::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Spawn { .. }));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/opt/run.sh"), "/opt/run.sh");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
