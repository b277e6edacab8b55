// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod connection_code;
pub mod critical_event;
pub mod device_action;
pub mod device_link;
pub mod event_queue;
pub mod idempotency;
pub mod link_mirror;
pub mod push;
pub mod retry;
pub mod subscriptions;
pub mod sync;

pub use connection_code::{CodeSource, ConnectionCodeService, RandomCodeSource};
pub use critical_event::{CriticalAlert, CriticalEventService};
pub use device_action::{ActionOutcome, DeviceActionService};
pub use device_link::{DeviceLinkService, DeviceLinkWatch, LinkSnapshot};
pub use event_queue::{BatchReport, EventQueue, OperationSink, QueuedOperation};
pub use idempotency::{DoseCheck, DoseCompletionTracker};
pub use link_mirror::LinkMirror;
pub use push::{ExpoPushSender, LogPushSender, PushMessage, PushSender};
pub use retry::RetryPolicy;
pub use sync::{StoreDelivery, SyncEngine, SyncSnapshot, SyncStatus};
