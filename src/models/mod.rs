// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models shared with the document store and the realtime tree.
//!
//! Document-store records use camelCase field names because the same
//! collections are read by the mobile clients.

pub mod connection_code;
pub mod critical_event;
pub mod device;
pub mod device_link;
pub mod intake;
pub mod medication;
pub mod user;

pub use connection_code::ConnectionCode;
pub use critical_event::{CriticalEventNotification, CriticalEventType, NewCriticalEvent, Severity};
pub use device::{ActionStatus, ActionType, DeviceActionRequest, DeviceEvent, DeviceEventType, DeviceState};
pub use device_link::{DeviceLink, LinkStatus};
pub use intake::{DeviceSource, IntakeRecord, IntakeStatus};
pub use medication::{EventSyncStatus, MedicationEvent, MedicationEventType};
pub use user::{Role, UserProfile};
