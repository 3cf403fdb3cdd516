use crate::budget::audit;
use crate::budget::paths::BudgetPaths;

/// Best-effort telemetry side channel. Calls never fail and never change
/// control flow.
pub trait Observer {
    fn breadcrumb(&self, _category: &str, _message: &str) {}
    fn capture_error(&self, _context: &str, _err: &anyhow::Error) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Records breadcrumbs and errors in the JSONL audit log.
pub struct AuditObserver {
    paths: BudgetPaths,
}

impl AuditObserver {
    pub fn new(paths: &BudgetPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }
}

impl Observer for AuditObserver {
    fn breadcrumb(&self, category: &str, message: &str) {
        if let Err(err) = audit::append_event(&self.paths, category, "ok", message) {
            tracing::debug!(error = %format!("{err:#}"), "audit breadcrumb dropped");
        }
    }

    fn capture_error(&self, context: &str, err: &anyhow::Error) {
        if let Err(audit_err) =
            audit::append_event(&self.paths, context, "error", &format!("{err:#}"))
        {
            tracing::debug!(error = %format!("{audit_err:#}"), "audit error event dropped");
        }
    }
}

/// Observer selected by the `telemetry.audit_log` switch.
pub fn from_config(paths: &BudgetPaths, audit_log: bool) -> Box<dyn Observer> {
    if audit_log {
        Box::new(AuditObserver::new(paths))
    } else {
        Box::new(NoopObserver)
    }
}
