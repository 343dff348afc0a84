//! mps-runtime
//!
//! Orchestration around the pure merge logic:
//! - [`EngineContext`]: explicit handle to store, gateway, audit sink and
//!   settings, built once and passed everywhere
//! - [`apply`]: one posting mutation per transaction, with its outbox row
//! - [`SyncEngine`]: checkpointed incremental / full pull
//! - [`WorkQueue`]: bounded worker pool for follow-up fetches
//! - [`OutboxDispatcher`]: lease, deliver, back off, give up
//! - [`RetryPolicy`]: the one backoff implementation every remote call uses

pub mod apply;
mod context;
mod follow_up;
mod gateway;
mod outbox;
mod queue;
mod retry;
mod sync;

pub use apply::{apply_operator, apply_remote, ApplyError, ApplyOutcome, Cause, OperatorAction};
pub use context::{EngineContext, EngineSettings};
pub use follow_up::{fetch_and_apply, FollowUpJob};
pub use gateway::{GatewayError, Page, PullRequest, RemoteGateway};
pub use outbox::{DeliveryError, DispatchReport, LogSink, OutboxDispatcher, OutboxSink};
pub use queue::{QueueFull, QueueStats, WorkQueue};
pub use retry::RetryPolicy;
pub use sync::{SyncEngine, SyncOutcome, SyncReport};
