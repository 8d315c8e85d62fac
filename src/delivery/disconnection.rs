//! Reaction to a failed stream

use std::sync::{Arc, Mutex};

use tonic::Code;
use tracing::{debug, error, info};

use crate::delivery::backoff::BackoffSchedule;
use crate::delivery::connection::ConnectionStatus;
use crate::delivery::policy::{FailureClassification, StatusBackoffPolicy};
use crate::delivery::supervisor::WeakChannelSupervisor;
use crate::metrics::{self, MetricSink};

/// Decides between ignoring a failure, backing off, or stopping forever.
///
/// Many streams may report the same outage; only the caller that wins
/// [`ConnectionStatus::should_reconnect`] acts on it.
pub struct DisconnectionHandler {
    status: Arc<ConnectionStatus>,
    policy: StatusBackoffPolicy,
    backoff: Mutex<BackoffSchedule>,
    metrics: Arc<dyn MetricSink>,
    supervisor: WeakChannelSupervisor,
}

impl DisconnectionHandler {
    pub(crate) fn new(
        status: Arc<ConnectionStatus>,
        backoff: BackoffSchedule,
        metrics: Arc<dyn MetricSink>,
        supervisor: WeakChannelSupervisor,
    ) -> Self {
        Self {
            status,
            policy: StatusBackoffPolicy::new(),
            backoff: Mutex::new(backoff),
            metrics,
            supervisor,
        }
    }

    /// Handle a stream failure carrying `code`.
    ///
    /// Retryable failures run the backoff on the calling task before
    /// returning; concurrent callers for the same outage return at once.
    pub async fn handle(&self, code: Option<Code>) {
        self.metrics.increment_counter(&metrics::grpc_status(code));

        if !self.status.should_reconnect() {
            debug!(code = ?code, "Disconnect already being handled, ignoring");
            return;
        }

        let Some(supervisor) = self.supervisor.upgrade() else {
            self.status.shut_down_forever();
            return;
        };

        match self.policy.classify(code) {
            FailureClassification::Fatal => {
                error!(
                    code = ?code,
                    "Trace observer does not support this client, Infinite Tracing will stop sending spans"
                );
                supervisor.shutdown_forever();
            }
            FailureClassification::Retryable => {
                let wait = self.next_backoff();
                info!(
                    code = ?code,
                    backoff_secs = wait.as_secs(),
                    "Infinite Tracing stream failed, reconnecting after backoff"
                );
                supervisor.shutdown_and_backoff(wait).await;
            }
        }
    }

    /// Stop forever regardless of state, for failures no retry can fix.
    pub fn terminate(&self) {
        match self.supervisor.upgrade() {
            Some(supervisor) => supervisor.shutdown_forever(),
            None => self.status.shut_down_forever(),
        }
    }

    /// A stream proved healthy; restart the backoff ladder.
    pub fn connection_healthy(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reset();
    }

    fn next_backoff(&self) -> std::time::Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next()
    }
}
