//! Failure classes surfaced by a build.
//!
//! Orchestration code works in `anyhow::Result`; these variants are what ends
//! up at the bottom of the context chain, so callers can still tell a policy
//! mistake from an overrun with `downcast_ref::<BuildError>()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed layer config, unresolvable base, unsupported format.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The limits document itself is wrong (missing entry, unit, or delta marker).
    #[error("Size policy error: {0}")]
    BudgetPolicy(String),

    /// A measured footprint is over a valid limit.
    #[error("Size budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Planned image footprint does not fit the declared image size.
    #[error("Image capacity error: {0}")]
    Capacity(String),

    /// An external tool exited non-zero.
    #[error("{message} (exit code {code}){}", stderr_suffix(.stderr))]
    ExternalTool {
        program: String,
        message: String,
        code: i32,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::BudgetPolicy(msg.into())
    }
}

/// Find the build error class anywhere in an anyhow chain.
pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_external_tool_message_includes_stderr() {
        let err = BuildError::ExternalTool {
            program: "tar".to_string(),
            message: "'tar' failed".to_string(),
            code: 2,
            stderr: "  tar: archive is corrupt\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "'tar' failed (exit code 2):\ntar: archive is corrupt"
        );
    }

    #[test]
    fn test_external_tool_message_without_stderr() {
        let err = BuildError::ExternalTool {
            program: "false".to_string(),
            message: "'false' failed".to_string(),
            code: 1,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "'false' failed (exit code 1)");
    }

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Error = Err::<(), _>(BuildError::policy("no unit"))
            .context("while checking limits")
            .unwrap_err();
        assert!(matches!(classify(&err), Some(BuildError::BudgetPolicy(_))));
    }
}
