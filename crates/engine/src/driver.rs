//! Per-driver context
//!
//! A [`Driver`] owns everything shared by the sessions of one device class
//! implementation: the dispatcher with its queue and worker, the physical
//! devices, the configuration. There is no global state; two drivers never
//! share a worker or a queue.

use crate::class::DeviceClass;
use crate::config::EngineConfig;
use crate::device::PhysicalDevice;
use crate::dispatcher::Dispatcher;
use crate::session::Session;
use crate::sink::EventSink;
use crate::types::{DeviceIndex, SessionId};
use common::lock_unpoisoned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct Driver {
    name: String,
    class: Arc<dyn DeviceClass>,
    config: Arc<EngineConfig>,
    dispatcher: Arc<Dispatcher>,
    devices: Mutex<BTreeMap<DeviceIndex, Arc<PhysicalDevice>>>,
    next_session: AtomicU32,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("class", &self.class.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Driver {
    pub fn new(name: impl Into<String>, class: Arc<dyn DeviceClass>, config: EngineConfig) -> Self {
        let name = name.into();
        let worker_name = config.worker_name.clone().unwrap_or_else(|| name.clone());
        info!(
            "Driver {} for {} (strict_fifo={}, callback_wait={})",
            name,
            class.name(),
            config.strict_fifo,
            config.callback_wait()
        );

        Self {
            dispatcher: Dispatcher::new(worker_name, class.clone()),
            name,
            class,
            config: Arc::new(config),
            devices: Mutex::new(BTreeMap::new()),
            next_session: AtomicU32::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &Arc<dyn DeviceClass> {
        &self.class
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The physical device with `index`, created on first use
    pub fn device(&self, index: DeviceIndex) -> Arc<PhysicalDevice> {
        lock_unpoisoned(&self.devices)
            .entry(index)
            .or_insert_with(|| Arc::new(PhysicalDevice::new(index)))
            .clone()
    }

    /// Open a new session on device `index`; the session starts Idle
    pub fn open_session(
        &self,
        index: DeviceIndex,
        logical_name: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Session> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        Session::open(
            id,
            logical_name.into(),
            self.device(index),
            self.dispatcher.clone(),
            self.class.clone(),
            self.config.clone(),
            sink,
        )
    }

    /// All open sessions, ordered by device
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let devices: Vec<Arc<PhysicalDevice>> =
            lock_unpoisoned(&self.devices).values().cloned().collect();
        devices.iter().flat_map(|d| d.sessions()).collect()
    }
}
