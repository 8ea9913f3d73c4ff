//! BLE transport trait definitions and core types
//!
//! Defines the abstract interface between the session state machine and the
//! BLE stack: a registry that resolves hardware addresses to connectable
//! handles, and a transport that owns connection, sensor configuration and
//! the sample-notification channel. The simulated transport and any future
//! real BLE (btleplug) implementation conform to these traits.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::BleError;

/// A 6-byte BLE hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BleAddress([u8; 6]);

impl BleAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for BleAddress {
    type Err = BleError;

    /// Parses the colon-separated form, e.g. `F2:FC:66:32:11:51`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(BleError::InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts.iter()) {
            if part.len() != 2 {
                return Err(BleError::InvalidAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| BleError::InvalidAddress(s.to_string()))?;
        }
        Ok(BleAddress(octets))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// An opaque connectable handle produced by a [`DeviceRegistry`].
///
/// Valid only for the session attempt it was resolved for.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    address: BleAddress,
}

impl DeviceHandle {
    pub fn new(address: BleAddress) -> Self {
        Self { address }
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }
}

/// One accelerometer notification as delivered by the transport.
///
/// Readings carry no device time; the session stamps each one with wall-clock
/// time at arrival.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelReading {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Fixed accelerometer configuration applied during session setup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Output data rate in Hz.
    pub odr_hz: f32,
    /// Full-scale range in g.
    pub range_g: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            odr_hz: 50.0,
            range_g: 8.0,
        }
    }
}

/// Resolves a hardware address to a connectable handle.
pub trait DeviceRegistry: Send + Sync {
    /// Returns `None` when the registry cannot produce a handle for the
    /// address. This is a local lookup, never a radio operation.
    fn resolve(&self, address: &BleAddress) -> Option<DeviceHandle>;
}

/// BLE central role scoped to one sensor peripheral: connection lifecycle,
/// sensor configuration and sample notifications.
#[async_trait]
pub trait SensorTransport: Send + Sync {
    /// Open a connection to the peripheral.
    async fn connect(&self, handle: &DeviceHandle) -> Result<(), BleError>;

    /// Close the connection to the peripheral.
    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), BleError>;

    /// Apply the sensor configuration. Acceptance is synchronous from the
    /// caller's perspective.
    fn configure(&self, handle: &DeviceHandle, config: &SensorConfig) -> Result<(), BleError>;

    /// Enable sample notifications and return the channel they arrive on.
    /// The transport closes the channel when notifications end.
    async fn subscribe(&self, handle: &DeviceHandle)
        -> Result<mpsc::Receiver<AccelReading>, BleError>;

    /// Disable sample notifications. Best-effort: safe to call after the
    /// link is already gone.
    fn unsubscribe(&self, handle: &DeviceHandle);

    /// Subscribe to unsolicited link-loss notifications. The transport
    /// broadcasts the address of any peripheral that drops its connection
    /// without a local disconnect request.
    fn disconnects(&self) -> broadcast::Receiver<BleAddress>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: BleAddress = "F2:FC:66:32:11:51".parse().unwrap();
        assert_eq!(addr.octets(), [0xF2, 0xFC, 0x66, 0x32, 0x11, 0x51]);
        assert_eq!(addr.to_string(), "F2:FC:66:32:11:51");

        // Lower-case input is accepted, display is upper-case.
        let lower: BleAddress = "f2:fc:66:32:11:51".parse().unwrap();
        assert_eq!(lower, addr);
    }

    #[test]
    fn test_address_rejects_malformed_input() {
        assert!("F2:FC:66:32:11".parse::<BleAddress>().is_err());
        assert!("F2:FC:66:32:11:51:00".parse::<BleAddress>().is_err());
        assert!("G2:FC:66:32:11:51".parse::<BleAddress>().is_err());
        assert!("F2FC:66:32:11:511".parse::<BleAddress>().is_err());
        assert!("".parse::<BleAddress>().is_err());
    }

    #[test]
    fn test_reading_magnitude() {
        let reading = AccelReading::new(3.0, 4.0, 0.0);
        assert_eq!(reading.magnitude(), 5.0);
    }

    #[test]
    fn test_default_sensor_config() {
        let config = SensorConfig::default();
        assert_eq!(config.odr_hz, 50.0);
        assert_eq!(config.range_g, 8.0);
    }
}
