use std::collections::BTreeSet;
use std::time::Duration;

use ::time::OffsetDateTime;

use crate::session::SessionState;
use crate::types::{CombinedResult, ToolName};

/// Final artifact of a session, emitted once when every expected tool has reported.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub scan_id: String,
    pub domain: String,
    pub source: String,
    pub combined: CombinedResult,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}

impl CompletionEvent {
    pub fn elapsed(&self) -> Duration {
        Duration::try_from(self.ended_at - self.started_at).unwrap_or_default()
    }
}

/// Watches a session after each update and fires exactly once.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    expected: BTreeSet<ToolName>,
}

impl CompletionDetector {
    pub fn new(expected: impl IntoIterator<Item = ToolName>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
        }
    }

    pub fn expected(&self) -> &BTreeSet<ToolName> {
        &self.expected
    }

    /// True when every expected tool has a result in `state`.
    pub fn is_satisfied(&self, state: &SessionState) -> bool {
        let reported = self
            .expected
            .iter()
            .filter(|name| state.tools.get(*name).is_some_and(|t| t.has_reported()))
            .count();
        reported == self.expected.len()
    }

    /// Transition `state` to completed if the predicate holds for the first time.
    ///
    /// Returns the event only on that transition; completed or failed sessions
    /// never fire again.
    pub fn evaluate(&self, state: &mut SessionState, now: OffsetDateTime) -> Option<CompletionEvent> {
        if state.completed || state.failure.is_some() || !self.is_satisfied(state) {
            return None;
        }
        state.completed = true;
        state.ended_at = Some(now);
        Some(CompletionEvent {
            scan_id: state.request.scan_id.clone(),
            domain: state.request.domain.clone(),
            source: state.request.source.clone(),
            combined: state.combined.clone(),
            started_at: state.started_at,
            ended_at: now,
        })
    }
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(ToolName::DEFAULT)
    }
}
