//! Reconnect wait ladder

use std::time::Duration;

/// Default ladder in seconds; the final entry repeats forever.
pub const DEFAULT_BACKOFF_SECS: [u64; 6] = [15, 15, 30, 60, 120, 300];

/// Fixed escalation ladder of reconnect waits.
///
/// `next()` walks the ladder one step per call and then keeps returning the
/// final entry until `reset()` rewinds it.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
    cursor: usize,
}

impl BackoffSchedule {
    /// Create a schedule from an ordered ladder.
    ///
    /// An empty ladder degenerates to a single zero wait.
    pub fn new(steps: Vec<Duration>) -> Self {
        let steps = if steps.is_empty() {
            vec![Duration::ZERO]
        } else {
            steps
        };
        Self { steps, cursor: 0 }
    }

    /// Wait for the current step, advancing unless already on the last one.
    pub fn next(&mut self) -> Duration {
        let wait = self.steps[self.cursor];
        if self.cursor + 1 < self.steps.len() {
            self.cursor += 1;
        }
        wait
    }

    /// Rewind to the first step.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        )
    }
}
