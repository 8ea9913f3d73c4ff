//! BLE transport layer for accelerometer streaming
//!
//! Provides the transport and registry abstraction traits consumed by the
//! session state machine, and a simulated transport for testing without
//! real BLE hardware.

pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Invalid BLE address: {0}")]
    InvalidAddress(String),

    #[error("Peer disconnected")]
    Disconnected,
}
