// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Pillbox-Sync: pairing and bidirectional sync for connected pillboxes
//!
//! This crate links patients' dispensing devices with caregivers through
//! single-use connection codes, keeps medication schedules and device events
//! in sync between the document store and the device's realtime tree, and
//! raises critical events for caregivers.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod routes;
pub mod services;
pub mod time_utils;

use auth::SessionAuth;
use config::Config;
use db::DocumentStore;
use realtime::RealtimeStore;
use services::{
    CodeSource, ConnectionCodeService, CriticalEventService, DeviceActionService,
    DeviceLinkService, DoseCompletionTracker, EventQueue, LinkMirror, PushSender, StoreDelivery,
    SyncEngine,
};
use std::sync::Arc;

/// Shared application state.
///
/// Every service is constructed here from the two stores, so tests can wire
/// the same graph on in-memory backends.
pub struct AppState {
    pub config: Config,
    pub docs: Arc<dyn DocumentStore>,
    pub realtime: Arc<dyn RealtimeStore>,
    pub session: Arc<SessionAuth>,
    pub links: Arc<DeviceLinkService>,
    pub codes: Arc<ConnectionCodeService>,
    pub tracker: Arc<DoseCompletionTracker>,
    pub actions: Arc<DeviceActionService>,
    pub critical: Arc<CriticalEventService>,
    pub sync: Arc<SyncEngine>,
    pub mirror: Arc<LinkMirror>,
}

impl AppState {
    pub fn new(
        config: Config,
        docs: Arc<dyn DocumentStore>,
        realtime: Arc<dyn RealtimeStore>,
        session: Arc<SessionAuth>,
        push: Arc<dyn PushSender>,
        code_source: Arc<dyn CodeSource>,
        queue: Arc<EventQueue>,
    ) -> Self {
        let delay = config.retry_base_delay;

        let links = Arc::new(DeviceLinkService::new(
            realtime.clone(),
            docs.clone(),
            session.clone(),
            delay,
        ));
        let codes = Arc::new(ConnectionCodeService::new(
            docs.clone(),
            session.clone(),
            links.clone(),
            code_source,
            delay,
        ));
        let tracker = Arc::new(DoseCompletionTracker::new(docs.clone()));
        let actions = Arc::new(DeviceActionService::new(
            realtime.clone(),
            session.clone(),
            links.clone(),
            delay,
        ));
        let critical = Arc::new(CriticalEventService::new(
            docs.clone(),
            realtime.clone(),
            session.clone(),
            links.clone(),
            push,
            delay,
        ));
        let delivery = Arc::new(StoreDelivery::new(
            docs.clone(),
            realtime.clone(),
            tracker.clone(),
            critical.clone(),
            delay,
        ));
        let sync = Arc::new(SyncEngine::new(
            docs.clone(),
            realtime.clone(),
            queue,
            delivery,
            config.poll_interval,
        ));
        let mirror = Arc::new(LinkMirror::new(realtime.clone(), docs.clone()));

        Self {
            config,
            docs,
            realtime,
            session,
            links,
            codes,
            tracker,
            actions,
            critical,
            sync,
            mirror,
        }
    }

    /// Stop every flow, monitor and watch started through this state.
    pub fn shutdown(&self) {
        self.sync.shutdown();
        self.critical.shutdown();
        self.mirror.stop();
    }
}
