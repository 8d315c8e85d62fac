//! Connection state gate
//!
//! [`ConnectionStatus`] decides which caller gets to build a channel and which
//! caller gets to run a backoff cycle. Transitions are compare-and-swap on a
//! single atomic; callers that lose wait on a [`Notify`] until the winner
//! resolves its attempt.
//!
//! The atomic packs the state into the low byte and a backoff epoch into the
//! rest. Each backoff cycle gets a fresh epoch, and only the cycle holding the
//! current epoch may end the backoff.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tracing::debug;

/// Current phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel; the next caller becomes the connector
    Disconnected,
    /// A connector is building the channel
    Connecting,
    /// A channel and stream are live
    Connected,
    /// Waiting out a backoff before reconnecting
    BackingOff,
    /// Terminal: no further connection attempts
    Shutdown,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::BackingOff,
            _ => Self::Shutdown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::BackingOff => 3,
            Self::Shutdown => 4,
        }
    }
}

/// Outcome of [`ConnectionStatus::block_on_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    /// Caller is the sole owner of the upcoming connect attempt
    MustAttemptConnection,
    /// A live connection already exists
    AlreadyConnected,
    /// Shut down for good; stop trying
    GoAwayForever,
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = 0xff;

fn pack(state: ConnectionState, epoch: u64) -> u64 {
    (epoch << STATE_BITS) | u64::from(state.as_u8())
}

fn state_of(raw: u64) -> ConnectionState {
    ConnectionState::from_u8((raw & STATE_MASK) as u8)
}

fn epoch_of(raw: u64) -> u64 {
    raw >> STATE_BITS
}

/// Atomic connection state shared by every component that touches the channel.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: AtomicU64,
    changed: Notify,
}

impl ConnectionStatus {
    /// Start out disconnected
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(ConnectionState::Disconnected, 0)),
            changed: Notify::new(),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConnectionState {
        state_of(self.state.load(Ordering::Acquire))
    }

    /// Wait until a connection exists, the caller must create one, or the
    /// status is shut down.
    ///
    /// While another caller is connecting or backing off this suspends on a
    /// notification rather than polling.
    pub async fn block_on_connection(&self) -> BlockDecision {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before reading state so a transition in between is not missed
            notified.as_mut().enable();

            match self.state() {
                ConnectionState::Connected => return BlockDecision::AlreadyConnected,
                ConnectionState::Shutdown => return BlockDecision::GoAwayForever,
                ConnectionState::Disconnected => {
                    if self.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
                        return BlockDecision::MustAttemptConnection;
                    }
                }
                ConnectionState::Connecting | ConnectionState::BackingOff => {
                    notified.await;
                }
            }
        }
    }

    /// The connector finished building the channel.
    ///
    /// Returns false when the attempt was overtaken (backoff or shutdown) and
    /// the new channel should be discarded.
    pub fn did_connect(&self) -> bool {
        let won = self.transition(ConnectionState::Connecting, ConnectionState::Connected);
        self.changed.notify_waiters();
        won
    }

    /// The connector failed; let the next caller try again.
    pub fn failed_to_connect(&self) {
        self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
        self.changed.notify_waiters();
    }

    /// Claim the right to run a backoff cycle for a failed connection.
    ///
    /// Exactly one of any number of concurrent callers gets `true`.
    pub fn should_reconnect(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if state_of(current) != ConnectionState::Connected {
                return false;
            }
            match self.state.compare_exchange(
                current,
                pack(ConnectionState::BackingOff, epoch_of(current) + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Enter backoff regardless of the current phase, unless shut down.
    ///
    /// Returns the epoch that identifies this backoff cycle, or `None` once
    /// shut down. A later call supersedes any cycle still in progress.
    pub fn begin_backoff(&self) -> Option<u64> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if state_of(current) == ConnectionState::Shutdown {
                return None;
            }
            let epoch = epoch_of(current) + 1;
            match self.state.compare_exchange(
                current,
                pack(ConnectionState::BackingOff, epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(epoch),
                Err(actual) => current = actual,
            }
        }
    }

    /// Backoff cycle `epoch` is over; the next caller reconnects.
    ///
    /// Does nothing and returns false when a later cycle has taken over or
    /// the status has left `BackingOff`.
    pub fn reattempt_connection(&self, epoch: u64) -> bool {
        let ended = self
            .state
            .compare_exchange(
                pack(ConnectionState::BackingOff, epoch),
                pack(ConnectionState::Disconnected, epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !ended {
            debug!(epoch, "Backoff cycle was superseded, leaving connection state alone");
        }
        self.changed.notify_waiters();
        ended
    }

    /// Terminal transition. Idempotent.
    pub fn shut_down_forever(&self) {
        let previous = self
            .state
            .swap(pack(ConnectionState::Shutdown, 0), Ordering::AcqRel);
        if state_of(previous) != ConnectionState::Shutdown {
            debug!(previous = ?state_of(previous), "Connection status shut down forever");
        }
        self.changed.notify_waiters();
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if state_of(current) != from {
                return false;
            }
            match self.state.compare_exchange(
                current,
                pack(to, epoch_of(current)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}
