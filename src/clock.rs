use std::time::Duration;

use ::time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::session::{SessionState, SessionStatus};
use crate::types::ToolName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgress {
    pub name: ToolName,
    pub phase: ToolPhase,
    pub elapsed: Duration,
}

/// What one clock tick shows: overall and per-tool elapsed time.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockTick {
    pub scan_id: String,
    pub status: SessionStatus,
    pub elapsed: Duration,
    pub reported: usize,
    pub tools: Vec<ToolProgress>,
}

impl ClockTick {
    /// Single status line, e.g. `[12s] 1/2 theHarvester done 8s | amass running 12s`.
    pub fn render(&self) -> String {
        let tools: Vec<String> = self
            .tools
            .iter()
            .map(|t| {
                let phase = match t.phase {
                    ToolPhase::Running => "running",
                    ToolPhase::Done => "done",
                    ToolPhase::Failed => "failed",
                };
                format!("{} {} {}s", t.name, phase, t.elapsed.as_secs())
            })
            .collect();
        format!(
            "[{}s] {}/{} {}",
            self.elapsed.as_secs(),
            self.reported,
            self.tools.len(),
            tools.join(" | ")
        )
    }
}

/// Read-only view of a session at `now`.
pub fn progress_view(state: &SessionState, now: OffsetDateTime) -> ClockTick {
    let tools = state
        .tools
        .values()
        .map(|t| ToolProgress {
            name: t.name,
            phase: if t.has_reported() {
                ToolPhase::Done
            } else if t.error.is_some() {
                ToolPhase::Failed
            } else {
                ToolPhase::Running
            },
            elapsed: t.elapsed(now),
        })
        .collect();
    ClockTick {
        scan_id: state.request.scan_id.clone(),
        status: state.status(),
        elapsed: state.elapsed(now),
        reported: state.reported_count(),
        tools,
    }
}

/// Periodic refresh of displayed durations, independent of message arrival.
///
/// Holds only a receiver of session snapshots, so it can never change session
/// state. Stops on cancellation, when the session finishes, or when the owning
/// session is dropped.
pub struct LiveClock {
    cancel: CancellationToken,
    handle: JoinHandle<usize>,
}

impl LiveClock {
    pub fn spawn<F>(
        mut snapshots: watch::Receiver<SessionState>,
        period: Duration,
        cancel: CancellationToken,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut(ClockTick) + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if snapshots.borrow().status() == SessionStatus::Running {
                            continue;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                let tick = progress_view(&snapshots.borrow_and_update(), OffsetDateTime::now_utc());
                let finished = tick.status != SessionStatus::Running;
                on_tick(tick);
                ticks += 1;
                if finished {
                    break;
                }
            }
            ticks
        });
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the clock task and return how many ticks it emitted.
    pub async fn join(self) -> usize {
        self.handle.await.unwrap_or(0)
    }
}
