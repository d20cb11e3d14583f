// =============================================================================
// Decision Envelope — Auditable record of every trade/no-trade decision
// =============================================================================
//
// Every signal flows through three layers: the condition-tree evaluator
// (C3), the risk pipeline (C5's seven fail-fast checks), and order
// execution. The Decision Envelope captures the verdict from each layer so
// every decision, allowed or blocked, can be replayed from the ledger and
// audited after the fact (spec §4.3, §4.5).
//
// The struct fields use `String` for verdicts (not Option<String>) to match
// the construction pattern at the call sites, where all fields are
// populated at creation time.
// =============================================================================

use serde::Serialize;

/// Complete auditable record of a trade decision, including all layer verdicts.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,

    /// Symbol the decision pertains to.
    pub symbol: String,

    /// "BUY" or "SELL".
    pub side: String,

    /// Name of the strategy that generated the signal.
    pub strategy_name: String,

    /// Condition-tree evaluator verdict ("PASS" / "FAIL").
    pub evaluator_verdict: String,

    /// Risk pipeline verdict ("PASS" / "FAIL").
    pub risk_verdict: String,

    /// Execution verdict ("PASS" / "FAIL").
    pub execution_verdict: String,

    /// Final decision: "ALLOW", "BLOCK", "SKIP".
    pub final_decision: String,

    /// Which layer blocked the trade (if blocked).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_layer: Option<String>,

    /// Human-readable reason for the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// ISO 8601 timestamp of when this decision was created.
    pub created_at: String,
}

impl DecisionEnvelope {
    /// Create a new decision envelope that allows the trade.
    pub fn allow(
        symbol: impl Into<String>,
        side: impl Into<String>,
        strategy_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side: side.into(),
            strategy_name: strategy_name.into(),
            evaluator_verdict: "PASS".to_string(),
            risk_verdict: "PASS".to_string(),
            execution_verdict: "PASS".to_string(),
            final_decision: "ALLOW".to_string(),
            blocking_layer: None,
            reason: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Create a blocked decision. `blocking_layer` is one of
    /// `"evaluator"`, `"risk"`, `"execution"`.
    pub fn blocked(
        symbol: impl Into<String>,
        side: impl Into<String>,
        strategy_name: impl Into<String>,
        blocking_layer: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let layer = blocking_layer.into();
        let (evaluator_verdict, risk_verdict) = match layer.as_str() {
            "evaluator" => ("FAIL".to_string(), "PASS".to_string()),
            "risk" => ("PASS".to_string(), "FAIL".to_string()),
            _ => ("PASS".to_string(), "PASS".to_string()),
        };
        let execution_verdict = if layer == "execution" { "FAIL".to_string() } else { "PASS".to_string() };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side: side.into(),
            strategy_name: strategy_name.into(),
            evaluator_verdict,
            risk_verdict,
            execution_verdict,
            final_decision: "BLOCK".to_string(),
            blocking_layer: Some(layer),
            reason: Some(reason.into()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
