//! Delivery core
//!
//! Connection state, stream lifecycle, failure recovery and the worker that
//! moves queued records onto the wire.

pub mod backoff;
pub mod connection;
pub mod disconnection;
pub mod policy;
pub mod queue;
pub mod response;
pub mod sender;
pub mod stream;
pub mod supervisor;

pub use backoff::BackoffSchedule;
pub use connection::{BlockDecision, ConnectionState, ConnectionStatus};
pub use disconnection::DisconnectionHandler;
pub use policy::{FailureClassification, StatusBackoffPolicy};
pub use queue::IngestQueue;
pub use response::{ResponseListener, StreamFailure};
pub use sender::DeliveryLoop;
pub use stream::{CancelCause, Cancellation, OutboundStream, SpanStream, StreamMode, WireItem};
pub use supervisor::{ChannelSupervisor, WeakChannelSupervisor};
