//! Offline-first synchronization with the remote server.
//!
//! # Flow
//!
//! - A store commit appends an outbox entry ([`capture`]) and raises a
//!   [`SyncSignal`] for the entity.
//! - The [`dispatcher`] coalesces signals and runs one push pass per entity.
//! - The [`push`] pipeline turns pending entries into a bulk write.
//! - The [`pull`] reconciler and the [`idempotency`] tracker bring server
//!   state in without echoing it back.

pub mod capture;
pub mod connectivity;
pub mod dispatcher;
pub mod idempotency;
pub mod listener;
pub mod pull;
pub mod push;
pub mod remote;
pub mod service;
pub mod signal;
pub mod status;

pub use capture::{CaptureDecision, CapturedChange, Change, ChangeCapture, SkipReason};
pub use connectivity::Connectivity;
pub use dispatcher::DispatcherConfig;
pub use idempotency::{IdempotencyTracker, NotificationKind, NotificationOutcome, ServerNotification};
pub use listener::NotificationListener;
pub use pull::{PullReconciler, ReconcileReport};
pub use push::{PushConfig, PushPipeline, PushReport};
pub use remote::{build_ws_url, BulkWriteRequest, BulkWriteResponse, HttpRemote, PullQuery, RemoteApi};
pub use service::{SyncService, SyncSettings};
pub use signal::{signal_channels, Published, SignalPublisher, SyncSignal};
pub use status::{StatusReporter, SyncStatus};
