//! Self-reported internal health
//!
//! Components that hit a problem the platform should know about (renewal
//! failing, certificate expired) raise a named issue here. The lifecycle
//! reports Degraded while any issue is outstanding.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Issue raised while certificate renewal keeps failing
pub const RENEWAL_FAILING: &str = "certificate_renewal_failing";

/// Issue raised once the serving certificate has expired
pub const CERTIFICATE_EXPIRED: &str = "certificate_expired";

/// Set of outstanding internal issues
#[derive(Debug, Default)]
pub struct InternalHealth {
    issues: Mutex<BTreeSet<String>>,
}

impl InternalHealth {
    /// Empty health record
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an issue; raising an outstanding issue again is a no-op
    pub fn report(&self, issue: &str) {
        if self.issues.lock().insert(issue.to_string()) {
            warn!(issue = %issue, "Internal issue reported");
        }
    }

    /// Clear an issue
    pub fn resolve(&self, issue: &str) {
        if self.issues.lock().remove(issue) {
            info!(issue = %issue, "Internal issue resolved");
        }
    }

    /// Whether any issue is outstanding
    pub fn is_degraded(&self) -> bool {
        !self.issues.lock().is_empty()
    }

    /// Outstanding issues, sorted
    pub fn issues(&self) -> Vec<String> {
        self.issues.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_raise_and_clear() {
        let health = InternalHealth::new();
        assert!(!health.is_degraded());

        health.report(RENEWAL_FAILING);
        health.report(RENEWAL_FAILING);
        health.report(CERTIFICATE_EXPIRED);
        assert!(health.is_degraded());
        assert_eq!(
            health.issues(),
            vec![CERTIFICATE_EXPIRED.to_string(), RENEWAL_FAILING.to_string()]
        );

        health.resolve(RENEWAL_FAILING);
        health.resolve(CERTIFICATE_EXPIRED);
        health.resolve("never-raised");
        assert!(!health.is_degraded());
    }
}
