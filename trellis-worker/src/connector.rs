//! Connector seam.
//!
//! The runtime owns the bus and the protocol; a connector only knows how to
//! talk to its devices. One implementation per device family, selected by
//! TRELLIS_CONNECTOR_TYPE.

use async_trait::async_trait;
use serde_json::{Map, Value};
use trellis_bus::NormalizerSet;

use crate::config::DeviceEntry;
use crate::error::WorkerError;

/// Result of polling one device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Full state object, published retained as the authoritative snapshot.
    pub state: Value,
    /// Radio/transport quality when the device family reports one.
    pub link_quality: Option<u8>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// One-time setup (open sockets, authenticate, discover).
    async fn start(&self) -> Result<(), WorkerError>;

    /// Releases device-side resources before the worker announces offline.
    async fn stop(&self) -> Result<(), WorkerError>;

    /// Reads the current state of one device.
    async fn poll_device(&self, device: &DeviceEntry) -> Result<DeviceSnapshot, WorkerError>;

    /// Applies normalized command values and returns the resulting state.
    async fn handle_command(
        &self,
        device: &DeviceEntry,
        values: &Map<String, Value>,
    ) -> Result<Value, WorkerError>;

    /// Value normalizers for this device family. Default: none.
    fn normalizers(&self) -> NormalizerSet {
        NormalizerSet::new()
    }
}

// Lets a shared connector be handed to the runtime while the supervisor
// keeps its own handle (parasite mode needs both).
#[async_trait]
impl<T: Connector + ?Sized> Connector for std::sync::Arc<T> {
    async fn start(&self) -> Result<(), WorkerError> {
        (**self).start().await
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        (**self).stop().await
    }

    async fn poll_device(&self, device: &DeviceEntry) -> Result<DeviceSnapshot, WorkerError> {
        (**self).poll_device(device).await
    }

    async fn handle_command(
        &self,
        device: &DeviceEntry,
        values: &Map<String, Value>,
    ) -> Result<Value, WorkerError> {
        (**self).handle_command(device, values).await
    }

    fn normalizers(&self) -> NormalizerSet {
        (**self).normalizers()
    }
}

/// Computes extension fields for a parasitized parent device. Implemented
/// by connectors that can run in parasite mode.
pub trait ParasiteCompute: Send + Sync {
    /// Derives extension fields from the parent's last known state.
    /// `None` when the parent state is missing or not usable yet: nothing
    /// is published in that case.
    fn compute_fields(
        &self,
        device: &DeviceEntry,
        parent_state: Option<&Value>,
    ) -> Option<Map<String, Value>>;
}
