//! Connectivity report for `flurry --check`.

use std::fmt;

use serde::Serialize;

/// Outcome of checking one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    /// What was found, or why the dependency is unusable.
    pub outcome: Result<String, String>,
}

/// Reachability of every dependency a run needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectivityReport {
    pub checks: Vec<CheckResult>,
}

impl ConnectivityReport {
    pub(crate) fn push(&mut self, name: &'static str, outcome: Result<String, String>) {
        self.checks.push(CheckResult { name, outcome });
    }

    /// Whether every check passed.
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|check| check.outcome.is_ok())
    }

    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|check| check.name == name)
    }
}

impl fmt::Display for ConnectivityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, check) in self.checks.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            match &check.outcome {
                Ok(detail) => write!(f, "ok    {:<12} {detail}", check.name)?,
                Err(reason) => write!(f, "FAIL  {:<12} {reason}", check.name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_failure_makes_the_report_unhealthy() {
        let mut report = ConnectivityReport::default();
        report.push("source", Ok("3 object(s) match '*.csv'".to_string()));
        assert!(report.is_healthy());

        report.push("token", Err("Unauthorized: bad secret".to_string()));
        assert!(!report.is_healthy());
        assert_eq!(
            report.to_string(),
            "ok    source       3 object(s) match '*.csv'\nFAIL  token        Unauthorized: bad secret"
        );
    }
}
