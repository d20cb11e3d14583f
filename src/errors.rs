// =============================================================================
// Engine Error Taxonomy
// =============================================================================
//
// Every rejected order or signal must surface `{code, message, retryable}`
// to the caller (never a stack trace). `EngineError` is the typed seam for
// that contract; internal plumbing (config I/O, ledger I/O, provider HTTP
// calls) keeps using `anyhow::Result` with `.context(...)` as the rest of
// this codebase does.
// =============================================================================

use serde::Serialize;

/// Stable machine-readable error code surfaced to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BelowMinimum,
    UnknownSymbol,
    MalformedRequest,
    DuplicatePosition,
    CapReached,
    ComplianceDenied,
    InsufficientBalance,
    BrakeActive,
    AssetInactive,
    CorrelationCapExceeded,
    VarCapExceeded,
    InsufficientLiquidity,
    NoYield,
    ProviderTimeout,
    ProviderRateLimited,
    StaleSeries,
    LedgerWriteFailure,
    CorruptedSnapshot,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Taxonomy bucket this error belongs to (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    State,
    Transient,
    Fatal,
}

/// The engine's typed error seam. Carries everything needed to build the
/// `{code, message, retryable}` payload the REST layer returns verbatim.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl EngineError {
    pub fn input(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Input,
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn state(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::State,
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            code,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Wire shape returned to REST callers for any rejected order/signal.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorResponse {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code,
            message: e.message.clone(),
            retryable: e.retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_not_retryable() {
        let e = EngineError::input(ErrorCode::BelowMinimum, "qty below minimum");
        assert!(!e.retryable);
        assert_eq!(e.kind, ErrorKind::Input);
    }

    #[test]
    fn transient_errors_are_retryable() {
        let e = EngineError::transient(ErrorCode::ProviderTimeout, "provider timed out");
        assert!(e.retryable);
    }

    #[test]
    fn error_response_roundtrip() {
        let e = EngineError::state(ErrorCode::BrakeActive, "emergency brake active");
        let resp: ErrorResponse = (&e).into();
        assert_eq!(resp.code, ErrorCode::BrakeActive);
        assert!(!resp.retryable);
    }
}
