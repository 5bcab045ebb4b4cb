//! Bus Facade
//!
//! The typed interface the daemon consumes instead of raw D-Bus. The
//! coordinator and supervisor only ever talk to this trait; the BlueZ
//! implementation lives in `controller::bluez` and is the sole component
//! aware of the underlying transport. Tests substitute a mock.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::events::{ObjectPath, ObjectSummary};

#[cfg(test)]
use mockall::automock;

/// An error carrying out a bus operation.
#[derive(Debug, Error)]
pub enum BusError {
    /// A method call failed. Transient: the supervisor retries the
    /// current phase with backoff.
    #[error("bus call failed: {0}")]
    Transport(String),
    /// The bus connection itself is gone. Fatal: surfaces to process
    /// exit.
    #[error("bus connection lost: {0}")]
    ConnectionLost(String),
}

/// The type of write operation to use, as BlueZ spells it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// Write request; the device confirms or errors.
    Request,
    /// Write-without-response.
    #[allow(dead_code)]
    Command,
}

impl WriteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Command => "command",
        }
    }
}

/// Options for a characteristic write. The thermometer's command
/// characteristic wants every write as a request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteOptions {
    pub write_type: Option<WriteType>,
}

impl WriteOptions {
    pub fn request() -> Self {
        Self {
            write_type: Some(WriteType::Request),
        }
    }
}

/// Typed facade over the BLE host stack.
///
/// Object enumeration and method calls only; signals are delivered out of
/// band as [`BusEvent`](crate::core::events::BusEvent)s on the coordinator
/// channel. Every call may block on the transport and carries the
/// implementation's per-call timeout.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BusApi: Send + Sync {
    /// Snapshot of all managed objects, keyed by object path.
    async fn enumerate_objects(&self) -> Result<HashMap<ObjectPath, ObjectSummary>, BusError>;

    /// `Device1.Connect` on the given device path.
    async fn connect_device(&self, path: &str) -> Result<(), BusError>;

    /// `Device1.Disconnect` on the given device path.
    async fn disconnect_device(&self, path: &str) -> Result<(), BusError>;

    /// Writes the `Device1.Trusted` property.
    async fn set_trusted(&self, path: &str, trusted: bool) -> Result<(), BusError>;

    /// `Adapter1.RemoveDevice`, flushing the stack's cache of the device.
    async fn remove_device(&self, path: &str) -> Result<(), BusError>;

    /// `GattCharacteristic1.StartNotify`.
    async fn start_notify(&self, path: &str) -> Result<(), BusError>;

    /// `GattCharacteristic1.StopNotify`.
    async fn stop_notify(&self, path: &str) -> Result<(), BusError>;

    /// `GattCharacteristic1.WriteValue`.
    async fn write_value(
        &self,
        path: &str,
        value: &[u8],
        options: WriteOptions,
    ) -> Result<(), BusError>;

    /// `GattCharacteristic1.ReadValue`. Used by the stall-recovery path to
    /// provoke a fresh notification.
    async fn read_value(&self, path: &str) -> Result<Vec<u8>, BusError>;
}
