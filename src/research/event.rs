use serde::Serialize;

/// Maximum length of a Status detail before truncation.
pub const STATUS_DETAIL_MAX: usize = 80;

/// One citation attached to a synthesis step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A phased-pipeline event. One ordered sequence of these carries all
/// signaling; the kind is a tagged discriminant, never inferred from shape.
///
/// Ordering contract: all Source events for a synthesis step precede the
/// first Content event they support; Status may interleave anywhere.
/// "Real answer production has begun" is computed from Content events
/// exclusively; Status-only activity must not suppress fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseEvent {
    /// A phase transition. Advisory only, never terminal.
    Status {
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Citations becoming available.
    Source { items: Vec<SourceRef> },
    /// An incremental fragment of the final answer.
    Content { text: String },
}

impl PhaseEvent {
    pub fn status(label: &str, detail: impl Into<String>) -> Self {
        PhaseEvent::Status {
            label: label.to_string(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, PhaseEvent::Content { .. })
    }
}

/// Truncate a sub-question or gap for use as a Status detail.
/// Strings over 80 chars become their first 80 chars plus `...`;
/// anything at or under the limit passes through unchanged.
pub fn truncate_detail(text: &str) -> String {
    if text.chars().count() > STATUS_DETAIL_MAX {
        let head: String = text.chars().take(STATUS_DETAIL_MAX).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
