//! External command invocation for command-backed samplers

use crate::error::CommandError;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;

/// Run `program args..` with extra environment and return the first stdout line.
///
/// The child inherits the agent's environment; `env` entries override it.
pub(crate) async fn first_line(
    program: &str,
    args: &[&str],
    env: &HashMap<String, String>,
) -> Result<String, CommandError> {
    let display = format!("{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            command: display.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Exit {
            command: display,
            status: output.status,
        });
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or(CommandError::NoOutput { command: display })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_line_of_output() {
        let line = first_line("printf", &["first\\nsecond\\n"], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(line, "first");
    }

    #[tokio::test]
    async fn test_extra_environment_is_passed() {
        let env = HashMap::from([("SAMPLER_TEST_VALUE".to_string(), "42".to_string())]);
        let line = first_line("sh", &["-c", "echo value=$SAMPLER_TEST_VALUE"], &env)
            .await
            .unwrap();
        assert_eq!(line, "value=42");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = first_line("/nonexistent/command", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_failing_program() {
        let result = first_line("false", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(CommandError::Exit { .. })));
    }

    #[tokio::test]
    async fn test_empty_output() {
        let result = first_line("true", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(CommandError::NoOutput { .. })));
    }
}
