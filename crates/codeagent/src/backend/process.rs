//! Child process helpers shared by the backends.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use log::{debug, warn};
use regex::RegexSet;
use tokio::process::Child;

use crate::error::{SessionError, SessionResult};

/// Stop a child: SIGTERM first, SIGKILL once `grace` has passed.
///
/// Returns the exit status when the child could be reaped.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if let Some(pid) = child.id() {
        debug!("sending SIGTERM to pid {}", pid);
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return Some(status);
        }
        warn!(
            "pid {} did not exit within {}s of SIGTERM, killing",
            pid,
            grace.as_secs()
        );
    }

    if let Err(e) = child.kill().await {
        warn!("failed to kill child process: {}", e);
        return None;
    }
    child.try_wait().ok().flatten()
}

/// Whether `binary` can be executed, either as a path or via `PATH`.
pub fn binary_exists(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.is_absolute() || binary.contains('/') {
        return path.is_file();
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

/// Output patterns that identify authentication failures.
#[derive(Debug, Clone)]
pub struct AuthMatcher {
    set: RegexSet,
}

impl AuthMatcher {
    /// Compile case-insensitive patterns.
    pub fn new(patterns: &[String]) -> SessionResult<Self> {
        let patterns: Vec<String> = patterns.iter().map(|p| format!("(?i){}", p)).collect();
        let set = RegexSet::new(&patterns).map_err(|e| {
            SessionError::Configuration(format!("invalid auth failure pattern: {}", e))
        })?;
        Ok(Self { set })
    }

    pub fn is_auth_failure(&self, output: &str) -> bool {
        self.set.is_match(output)
    }

    /// Classify a failed run from its exit status and combined output.
    pub fn classify(&self, status: &str, output: String) -> SessionError {
        if self.is_auth_failure(&output) {
            SessionError::Auth { output }
        } else {
            SessionError::Execution {
                status: status.to_string(),
                output,
            }
        }
    }
}

/// Replace `{prompt}` in `args`, or append the message when no argument
/// carries the placeholder.
pub fn substitute_prompt(args: &[String], message: &str) -> Vec<String> {
    let mut substituted = false;
    let mut out: Vec<String> = args
        .iter()
        .map(|arg| {
            if arg.contains("{prompt}") {
                substituted = true;
                arg.replace("{prompt}", message)
            } else {
                arg.clone()
            }
        })
        .collect();
    if !substituted {
        out.push(message.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::process::Command;

    #[test]
    fn test_substitute_prompt() {
        let args = vec!["--print".to_string(), "{prompt}".to_string()];
        assert_eq!(substitute_prompt(&args, "hi"), vec!["--print", "hi"]);

        let args = vec!["exec".to_string()];
        assert_eq!(substitute_prompt(&args, "hi"), vec!["exec", "hi"]);
    }

    #[test]
    fn test_auth_matcher() {
        let matcher = AuthMatcher::new(&["invalid api key".to_string()]).unwrap();
        assert!(matcher.is_auth_failure("Error: Invalid API Key supplied"));
        assert!(matches!(
            matcher.classify("exit status: 1", "INVALID API KEY".to_string()),
            SessionError::Auth { .. }
        ));
        assert!(matches!(
            matcher.classify("exit status: 1", "segfault".to_string()),
            SessionError::Execution { .. }
        ));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let err = AuthMatcher::new(&["(unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("definitely-not-a-real-binary-xyz"));
        assert!(!binary_exists("/nonexistent/bin/tool"));
    }

    #[tokio::test]
    async fn test_terminate_sigterm() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
