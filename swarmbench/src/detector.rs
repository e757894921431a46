use std::time::Duration;
use tokio::time::Instant;
use crate::{config::Timing, monitor::IterationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    // Terminal.
    Finished,
    // Terminal.
    TimedOut,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        *self != Phase::Running
    }
}

#[derive(Debug)]
pub struct CompletionDetector {

    grace_window: Duration,

    reannounce_interval: u64,

    // Unix second of the last re-announce, so a slow tick can't fire twice in one second.
    last_reannounce: Option<i64>,

}

impl CompletionDetector {

    pub fn new(timing: &Timing) -> Self {
        Self {
            grace_window: timing.grace_window,
            reannounce_interval: timing.reannounce_interval.as_secs().max(1),
            last_reannounce: None,
        }
    }

    // Advances the iteration's phase. Once terminal the phase never changes.
    pub fn evaluate(&self, state: &mut IterationState, is_finished: bool, now: Instant) -> Phase {
        if state.phase.is_terminal() {
            return state.phase;
        }

        if is_finished {
            state.phase = Phase::Finished;
        } else if self.is_stalled(state, now) {
            state.phase = Phase::TimedOut;
        }
        state.phase
    }

    // Nothing received within the grace window. A transfer that started,
    // however slowly, is never considered stalled.
    fn is_stalled(&self, state: &IterationState, now: Instant) -> bool {
        now.saturating_duration_since(state.start) > self.grace_window
            && !state.transfer_started()
            && state.downloaded() == 0
    }

    // Re-announce cadence is aligned to absolute time, not to the iteration start.
    pub fn reannounce_due(&mut self, state: &IterationState, unix_secs: i64) -> bool {
        if state.phase.is_terminal() {
            return false;
        }
        if unix_secs.rem_euclid(self.reannounce_interval as i64) != 0 {
            return false;
        }
        if self.last_reannounce == Some(unix_secs) {
            return false;
        }
        self.last_reannounce = Some(unix_secs);
        true
    }

}
