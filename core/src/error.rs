use serde_json::Value;

/// Tagged error taxonomy for the orchestrator core. Every fallible operation
/// returns `Result<T, OrchError>`; the payload shape mirrors what gets written
/// into an event's `error` field (`{type, msg, hint?, details?}`).
#[derive(Debug, thiserror::Error)]
pub enum OrchError {
    #[error("plan invalid: {msg}")]
    PlanInvalid { msg: String, hint: Option<String> },

    #[error("security block: {msg}")]
    SecurityBlock { msg: String, hint: Option<String> },

    #[error("dataset block: {msg}")]
    DatasetBlock {
        msg: String,
        hint: Option<String>,
        details: Option<Value>,
    },

    #[error("alignment block: {msg}")]
    AlignmentBlock {
        msg: String,
        hint: Option<String>,
        details: Option<Value>,
    },

    #[error("budget block: {msg}")]
    BudgetBlock { msg: String, hint: Option<String> },

    #[error("health check failed: {msg}")]
    HealthCheck {
        msg: String,
        hint: Option<String>,
        details: Option<Value>,
    },

    #[error("runner timeout: {msg}")]
    RunnerTimeout {
        msg: String,
        hint: Option<String>,
        details: Option<Value>,
    },

    #[error("runner failed: {msg}")]
    RunnerFailed {
        msg: String,
        hint: Option<String>,
        details: Option<Value>,
    },

    #[error("metrics unavailable: {msg}")]
    MetricsUnavailable { msg: String, hint: Option<String> },

    #[error("queue full: {msg}")]
    QueueFull { msg: String },

    #[error("stage {stage} failed: {inner}")]
    StageFailed { stage: String, inner: Box<OrchError> },

    #[error("not found: {msg}")]
    NotFound { msg: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchError {
    pub fn plan_invalid(msg: impl Into<String>) -> Self {
        OrchError::PlanInvalid {
            msg: msg.into(),
            hint: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchError::PlanInvalid { .. } => "PlanInvalid",
            OrchError::SecurityBlock { .. } => "SecurityBlock",
            OrchError::DatasetBlock { .. } => "DatasetBlock",
            OrchError::AlignmentBlock { .. } => "AlignmentBlock",
            OrchError::BudgetBlock { .. } => "BudgetBlock",
            OrchError::HealthCheck { .. } => "HealthCheck",
            OrchError::RunnerTimeout { .. } => "RunnerTimeout",
            OrchError::RunnerFailed { .. } => "RunnerFailed",
            OrchError::MetricsUnavailable { .. } => "MetricsUnavailable",
            OrchError::QueueFull { .. } => "QueueFull",
            OrchError::StageFailed { .. } => "StageFailed",
            OrchError::NotFound { .. } => "NotFound",
            OrchError::Io(_) => "Io",
            OrchError::Json(_) => "Json",
        }
    }

    /// Renders the `{type, msg, hint?, details?}` shape used in event payloads.
    pub fn to_payload(&self) -> Value {
        let (hint, details): (Option<&str>, Option<&Value>) = match self {
            OrchError::PlanInvalid { hint, .. } => (hint.as_deref(), None),
            OrchError::SecurityBlock { hint, .. } => (hint.as_deref(), None),
            OrchError::DatasetBlock { hint, details, .. } => (hint.as_deref(), details.as_ref()),
            OrchError::AlignmentBlock { hint, details, .. } => (hint.as_deref(), details.as_ref()),
            OrchError::BudgetBlock { hint, .. } => (hint.as_deref(), None),
            OrchError::HealthCheck { hint, details, .. } => (hint.as_deref(), details.as_ref()),
            OrchError::RunnerTimeout { hint, details, .. } => (hint.as_deref(), details.as_ref()),
            OrchError::RunnerFailed { hint, details, .. } => (hint.as_deref(), details.as_ref()),
            OrchError::MetricsUnavailable { hint, .. } => (hint.as_deref(), None),
            _ => (None, None),
        };
        let mut payload = serde_json::json!({
            "type": self.kind(),
            "msg": self.to_string(),
        });
        if let Some(h) = hint {
            payload["hint"] = Value::String(h.to_string());
        }
        if let Some(d) = details {
            payload["details"] = d.clone();
        }
        payload
    }
}

pub type Result<T> = std::result::Result<T, OrchError>;
