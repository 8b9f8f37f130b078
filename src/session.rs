use std::collections::BTreeMap;
use std::time::Duration;

use ::time::OffsetDateTime;

use crate::merge::merge;
use crate::types::{CombinedResult, Findings, ScanRequest, ToolFrame, ToolName};

/// Lifecycle of one expected tool inside a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolState {
    pub name: ToolName,
    pub started_at: OffsetDateTime,
    pub result: Option<Findings>,
    pub ended_at: Option<OffsetDateTime>,
    /// Set when the backend reported the tool as failed instead of sending findings.
    pub error: Option<String>,
}

impl ToolState {
    pub fn new(name: ToolName, started_at: OffsetDateTime) -> Self {
        Self {
            name,
            started_at,
            result: None,
            ended_at: None,
            error: None,
        }
    }

    pub fn has_reported(&self) -> bool {
        self.result.is_some()
    }

    /// Time since the tool started, frozen once it ended.
    pub fn elapsed(&self, now: OffsetDateTime) -> Duration {
        span(self.started_at, self.ended_at.unwrap_or(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// The single mutable record of a scan session, owned by its stream client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub request: ScanRequest,
    pub tools: BTreeMap<ToolName, ToolState>,
    pub combined: CombinedResult,
    pub completed: bool,
    pub failure: Option<String>,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
}

impl SessionState {
    /// Fresh session with one not-yet-reported entry per expected tool.
    pub fn new(
        request: ScanRequest,
        expected: impl IntoIterator<Item = ToolName>,
        now: OffsetDateTime,
    ) -> Self {
        let tools = expected
            .into_iter()
            .map(|name| (name, ToolState::new(name, now)))
            .collect();
        Self {
            request,
            tools,
            combined: CombinedResult::default(),
            completed: false,
            failure: None,
            started_at: now,
            ended_at: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.completed {
            SessionStatus::Completed
        } else if self.failure.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Running
        }
    }

    pub fn reported_count(&self) -> usize {
        self.tools.values().filter(|t| t.has_reported()).count()
    }

    pub fn elapsed(&self, now: OffsetDateTime) -> Duration {
        span(self.started_at, self.ended_at.unwrap_or(now))
    }

    /// Snapshot marked as failed after a transport problem. Merged findings are kept.
    /// A completed session stays completed.
    pub fn mark_failed(&self, reason: impl Into<String>, now: OffsetDateTime) -> SessionState {
        let mut next = self.clone();
        if next.completed || next.failure.is_some() {
            return next;
        }
        next.failure = Some(reason.into());
        next.ended_at = Some(now);
        next
    }
}

/// What `apply_tool_result` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// First findings for this tool.
    Recorded(ToolName),
    /// Later findings for a tool that had already reported; latest wins.
    Replaced(ToolName),
    /// The backend reported the tool as failed.
    ToolFailed(ToolName),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownTool(String),
    ForeignScan(String),
    /// The session already completed or failed.
    SessionClosed,
    /// Failure report for a tool that already delivered findings.
    AlreadyReported(ToolName),
    EmptyFrame,
}

/// Apply one inbound frame and return the next session snapshot.
///
/// The input snapshot is never modified. The combined result of the returned
/// snapshot is recomputed from the tool states; persistence is not triggered here.
pub fn apply_tool_result(
    state: &SessionState,
    frame: &ToolFrame,
    now: OffsetDateTime,
) -> (SessionState, Applied) {
    let ignored = |reason| (state.clone(), Applied::Ignored(reason));

    if state.completed || state.failure.is_some() {
        return ignored(IgnoreReason::SessionClosed);
    }
    if let Some(id) = &frame.scan_id {
        if *id != state.request.scan_id {
            return ignored(IgnoreReason::ForeignScan(id.clone()));
        }
    }
    let name = match frame.source.parse::<ToolName>() {
        Ok(name) if state.tools.contains_key(&name) => name,
        _ => return ignored(IgnoreReason::UnknownTool(frame.source.clone())),
    };

    let mut next = state.clone();
    let applied = {
        let Some(tool) = next.tools.get_mut(&name) else {
            return ignored(IgnoreReason::UnknownTool(frame.source.clone()));
        };
        match (&frame.result, &frame.error) {
            (Some(result), _) => {
                let replaced = tool.result.replace(result.clone()).is_some();
                tool.ended_at = Some(now);
                tool.error = None;
                if replaced {
                    Applied::Replaced(name)
                } else {
                    Applied::Recorded(name)
                }
            }
            (None, Some(_)) if tool.has_reported() => {
                return ignored(IgnoreReason::AlreadyReported(name));
            }
            (None, Some(err)) => {
                tool.error = Some(err.clone());
                tool.ended_at = Some(now);
                Applied::ToolFailed(name)
            }
            (None, None) => return ignored(IgnoreReason::EmptyFrame),
        }
    };
    next.combined = merge(&next.tools);
    (next, applied)
}

fn span(from: OffsetDateTime, to: OffsetDateTime) -> Duration {
    Duration::try_from(to - from).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        let request = ScanRequest::new("example.com", "bing");
        SessionState::new(request, ToolName::DEFAULT, OffsetDateTime::now_utc())
    }

    fn frame(source: &str, subs: &[&str]) -> ToolFrame {
        ToolFrame {
            source: source.to_string(),
            result: Some(Findings {
                subdomains: subs.iter().map(|s| s.to_string()).collect(),
                ..Findings::default()
            }),
            ..ToolFrame::default()
        }
    }

    #[test]
    fn new_session_has_one_pending_entry_per_tool() {
        let s = session();
        assert_eq!(s.tools.len(), 2);
        assert_eq!(s.reported_count(), 0);
        assert_eq!(s.status(), SessionStatus::Running);
        assert!(s.combined.is_empty());
    }

    #[test]
    fn apply_records_result_and_leaves_input_untouched() {
        let s = session();
        let now = OffsetDateTime::now_utc();
        let (next, applied) = apply_tool_result(&s, &frame("amass", &["a.example.com"]), now);
        assert_eq!(applied, Applied::Recorded(ToolName::Amass));
        assert_eq!(s.reported_count(), 0);
        assert_eq!(next.reported_count(), 1);
        assert_eq!(next.tools[&ToolName::Amass].ended_at, Some(now));
        assert!(next.combined.subdomains.contains("a.example.com"));
    }

    #[test]
    fn second_result_for_same_tool_replaces_first() {
        let now = OffsetDateTime::now_utc();
        let (s, _) = apply_tool_result(&session(), &frame("amass", &["a.example.com"]), now);
        let (s, applied) = apply_tool_result(&s, &frame("amass", &["b.example.com"]), now);
        assert_eq!(applied, Applied::Replaced(ToolName::Amass));
        assert!(!s.combined.subdomains.contains("a.example.com"));
        assert!(s.combined.subdomains.contains("b.example.com"));
    }

    #[test]
    fn unknown_tool_is_ignored() {
        let s = session();
        let (next, applied) =
            apply_tool_result(&s, &frame("sublist3r", &["x.example.com"]), OffsetDateTime::now_utc());
        assert_eq!(
            applied,
            Applied::Ignored(IgnoreReason::UnknownTool("sublist3r".into()))
        );
        assert_eq!(next, s);
    }

    #[test]
    fn frame_for_another_scan_is_ignored() {
        let s = session();
        let mut f = frame("amass", &["a.example.com"]);
        f.scan_id = Some("someone-else".into());
        let (next, applied) = apply_tool_result(&s, &f, OffsetDateTime::now_utc());
        assert!(matches!(applied, Applied::Ignored(IgnoreReason::ForeignScan(_))));
        assert_eq!(next, s);
    }

    #[test]
    fn failure_frame_marks_tool_without_result() {
        let s = session();
        let f = ToolFrame::failure(ToolName::TheHarvester, &s.request.scan_id, "exit status 1");
        let (next, applied) = apply_tool_result(&s, &f, OffsetDateTime::now_utc());
        assert_eq!(applied, Applied::ToolFailed(ToolName::TheHarvester));
        let tool = &next.tools[&ToolName::TheHarvester];
        assert_eq!(tool.error.as_deref(), Some("exit status 1"));
        assert!(!tool.has_reported());
        assert!(tool.ended_at.is_some());
    }

    #[test]
    fn mark_failed_keeps_partial_results() {
        let now = OffsetDateTime::now_utc();
        let (s, _) = apply_tool_result(&session(), &frame("amass", &["a.example.com"]), now);
        let failed = s.mark_failed("connection reset", now);
        assert_eq!(failed.status(), SessionStatus::Failed);
        assert_eq!(failed.combined, s.combined);
        let (after, applied) = apply_tool_result(&failed, &frame("theHarvester", &[]), now);
        assert_eq!(applied, Applied::Ignored(IgnoreReason::SessionClosed));
        assert_eq!(after, failed);
    }
}
