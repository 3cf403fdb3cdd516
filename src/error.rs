use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetErrorCode {
    E001SummaryTimeout,
    E002SummaryExit,
    E003SummaryUnparsable,
    E004StoreFailed,
    E005InvalidConfig,
    E006LedgerCorrupt,
    E007WorkerFailed,
}

impl BudgetErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001SummaryTimeout => "E001",
            Self::E002SummaryExit => "E002",
            Self::E003SummaryUnparsable => "E003",
            Self::E004StoreFailed => "E004",
            Self::E005InvalidConfig => "E005",
            Self::E006LedgerCorrupt => "E006",
            Self::E007WorkerFailed => "E007",
        }
    }
}

/// Failures a caller branches on. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("summarizer timed out after {0}s")]
    SummaryTimeout(u64),
    #[error("summarizer exited with {status}: {stderr}")]
    SummaryExit { status: String, stderr: String },
    #[error("summarizer output could not be parsed")]
    SummaryUnparsable,
    #[error("document store write failed: {0}")]
    StoreFailed(String),
}

impl BudgetError {
    pub fn code(&self) -> BudgetErrorCode {
        match self {
            Self::SummaryTimeout(_) => BudgetErrorCode::E001SummaryTimeout,
            Self::SummaryExit { .. } => BudgetErrorCode::E002SummaryExit,
            Self::SummaryUnparsable => BudgetErrorCode::E003SummaryUnparsable,
            Self::StoreFailed(_) => BudgetErrorCode::E004StoreFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BudgetError::SummaryTimeout(180).code().as_str(), "E001");
        assert_eq!(
            BudgetError::StoreFailed("503".into()).code().as_str(),
            "E004"
        );
    }
}
