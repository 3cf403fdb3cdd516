use crate::budget::config::{AutoResetConfig, BudgetConfig, MetricLimits};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricPolicy {
    pub warning: u64,
    pub critical: u64,
    pub auto_stop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdPolicy {
    pub session: MetricPolicy,
    pub total: MetricPolicy,
    pub auto_reset: AutoResetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Session,
    Total,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Total => "total",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    Normal,
    Warning,
    Critical,
}

impl BudgetState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub metric: Metric,
    pub value: u64,
    pub state: BudgetState,
    pub limits: MetricPolicy,
}

impl Evaluation {
    /// Whole percent of the critical threshold consumed.
    pub fn percent_of_critical(&self) -> u64 {
        if self.limits.critical == 0 {
            return 0;
        }
        self.value.saturating_mul(100) / self.limits.critical
    }
}

fn metric(limits: MetricLimits, auto_stop: bool) -> MetricPolicy {
    MetricPolicy {
        warning: limits.warning,
        critical: limits.critical,
        auto_stop,
    }
}

impl ThresholdPolicy {
    /// `host_auto_compact` decides which metric stops work: when the host
    /// compacts on its own, sessions turn over often and only the cumulative
    /// total is meaningful; otherwise the session is the budget.
    pub fn new(
        session: MetricLimits,
        total: MetricLimits,
        auto_reset: AutoResetConfig,
        host_auto_compact: bool,
    ) -> Self {
        Self {
            session: metric(session, !host_auto_compact),
            total: metric(total, host_auto_compact),
            auto_reset,
        }
    }

    pub fn from_config(cfg: &BudgetConfig) -> Self {
        Self::new(
            cfg.limits.session,
            cfg.limits.total,
            cfg.limits.auto_reset,
            cfg.host_auto_compact,
        )
    }

    pub fn primary(&self) -> Metric {
        if self.total.auto_stop {
            Metric::Total
        } else {
            Metric::Session
        }
    }

    pub fn limits_for(&self, metric: Metric) -> MetricPolicy {
        match metric {
            Metric::Session => self.session,
            Metric::Total => self.total,
        }
    }

    /// Evaluate one metric value against that metric's thresholds.
    pub fn evaluate_metric(&self, metric: Metric, value: u64) -> Evaluation {
        let limits = self.limits_for(metric);
        let state = if value >= limits.critical {
            BudgetState::Critical
        } else if value >= limits.warning {
            BudgetState::Warning
        } else {
            BudgetState::Normal
        };
        Evaluation {
            metric,
            value,
            state,
            limits,
        }
    }

    /// Evaluate the primary metric given the active session's tokens and the
    /// effective cumulative total.
    pub fn evaluate(&self, session_tokens: u64, total_tokens: u64) -> Evaluation {
        match self.primary() {
            Metric::Session => self.evaluate_metric(Metric::Session, session_tokens),
            Metric::Total => self.evaluate_metric(Metric::Total, total_tokens),
        }
    }
}

/// Latch decision for one evaluation. The latch stays set while the primary
/// metric remains critical so repeated samples do not relaunch compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    pub should_trigger: bool,
    pub set_latch: bool,
    pub clear_latch: bool,
}

pub fn evaluate_trigger(evaluation: &Evaluation, latched: bool) -> TriggerDecision {
    if evaluation.state != BudgetState::Critical {
        return TriggerDecision {
            should_trigger: false,
            set_latch: false,
            clear_latch: latched,
        };
    }
    if latched || !evaluation.limits.auto_stop {
        return TriggerDecision {
            should_trigger: false,
            set_latch: false,
            clear_latch: false,
        };
    }
    TriggerDecision {
        should_trigger: true,
        set_latch: true,
        clear_latch: false,
    }
}
