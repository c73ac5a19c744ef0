//! Scheduler message consumption and job dispatch.
//!
//! An external scheduler publishes small JSON messages naming a job. This
//! module turns them into work:
//!
//! - **StreamSubscription**: Redis Streams consumer group the messages arrive on
//! - **Consumer**: Long-running loop that decodes and acknowledges messages
//! - **Dispatcher**: Maps a job name to its action after checking credentials
//! - **JobMessage / JobKind**: The wire format and the closed set of jobs
//!
//! # Architecture
//!
//! ```text
//!     ┌─────────────┐      ┌──────────────┐      ┌────────────┐      ┌───────────┐
//!     │  Scheduler  │─────▶│ Redis stream │─────▶│  Consumer  │─────▶│Dispatcher │
//!     │ (publisher) │ XADD │  + group     │ XREAD│ decode/ack │      │ JobRunner │
//!     └─────────────┘      └──────────────┘ GROUP└────────────┘      └───────────┘
//! ```
//!
//! # Delivery Guarantees
//!
//! - **At-least-once**: Messages are acknowledged only after their job returns
//! - **Redelivery**: Undecodable or unacknowledged messages come back after the
//!   ack deadline
//! - **Failed jobs are acknowledged**: Job failures are logged, not retried

pub mod consumer;
pub mod dispatcher;
pub mod job;
pub mod queue;

pub use consumer::{Consumer, ConsumerConfig, ConsumerError, DeliveryOutcome};
pub use dispatcher::{Dispatcher, JobHandler, JobRunner};
pub use job::{Credential, CredentialPolicy, Credentials, JobKind, JobMessage};
pub use queue::{
    Delivery, MessageSource, QueueError, StreamPublisher, StreamSubscription, SubscriptionConfig,
};
