//! Step error classification

/// Errors returned by condition-guarded steps.
///
/// The engine needs to tell "retry later" outcomes apart from real failures:
/// the former leave the condition Unknown, the latter mark it False.
pub trait StepError: std::error::Error + Send + Sync + 'static {
    /// Whether the step is waiting on external progress rather than failing.
    fn is_not_ready(&self) -> bool {
        false
    }

    /// Short reason code recorded on the condition.
    fn reason(&self) -> String {
        if self.is_not_ready() {
            "Waiting".to_string()
        } else {
            "Error".to_string()
        }
    }
}

impl StepError for crate::store::StoreError {
    fn reason(&self) -> String {
        match self {
            Self::Conflict(_) => "Conflict".to_string(),
            Self::NotFound(_) => "NotFound".to_string(),
            _ => "StoreError".to_string(),
        }
    }
}
