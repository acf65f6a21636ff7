//! Preflight check types and report.

use std::fmt;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// A build will fail.
    Fail,
    /// Some layers may fail (optional collaborator missing).
    Warn,
    /// Not applicable to this configuration.
    Skip,
}

impl CheckStatus {
    fn label(self) -> (&'static str, &'static str) {
        match self {
            CheckStatus::Pass => ("✓", "PASS"),
            CheckStatus::Fail => ("✗", "FAIL"),
            CheckStatus::Warn => ("⚠", "WARN"),
            CheckStatus::Skip => ("○", "SKIP"),
        }
    }
}

impl CheckResult {
    fn with(name: &str, status: CheckStatus, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details,
        }
    }

    pub fn pass(name: &str, details: impl Into<String>) -> Self {
        Self::with(name, CheckStatus::Pass, Some(details.into()))
    }

    pub fn fail(name: &str, details: impl Into<String>) -> Self {
        Self::with(name, CheckStatus::Fail, Some(details.into()))
    }

    pub fn warn(name: &str, details: impl Into<String>) -> Self {
        Self::with(name, CheckStatus::Warn, Some(details.into()))
    }

    pub fn skip(name: &str) -> Self {
        Self::with(name, CheckStatus::Skip, None)
    }

    /// Fail, or only warn when the thing checked is optional.
    pub fn missing(name: &str, details: impl Into<String>, required: bool) -> Self {
        if required {
            Self::fail(name, details)
        } else {
            Self::warn(name, details)
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (icon, label) = self.status.label();
        write!(f, "{} [{}] {}", icon, label, self.name)?;
        if let Some(ref details) = self.details {
            write!(f, ": {}", details)?;
        }
        Ok(())
    }
}

/// Results of all preflight checks.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn all_passed(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");
        for check in &self.checks {
            println!("  {}", check);
        }

        println!();
        println!(
            "Summary: {}/{} passed",
            self.count(CheckStatus::Pass),
            self.checks.len()
        );
        if self.fail_count() > 0 {
            println!("         {} FAILED - layers cannot be built", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}
