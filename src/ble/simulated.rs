//! In-process BLE sensor simulator
//!
//! Provides a simulated sensor network where peripherals can be registered,
//! connected to, configured and streamed from entirely in-process. Supports
//! per-device failure injection and link-loss simulation, so session
//! behavior can be tested without real BLE hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, mpsc};

use super::transport::{
    AccelReading, BleAddress, DeviceHandle, DeviceRegistry, SensorConfig, SensorTransport,
};
use super::BleError;

const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Per-device failure injection switches. Each stays in effect until cleared.
#[derive(Debug, Default, Clone, Copy)]
struct FaultPlan {
    connect: bool,
    configure: bool,
    subscribe: bool,
    disconnect: bool,
}

struct SimDevice {
    connected: bool,
    config: Option<SensorConfig>,
    sample_tx: Option<mpsc::Sender<AccelReading>>,
    faults: FaultPlan,
}

impl SimDevice {
    fn new() -> Self {
        Self {
            connected: false,
            config: None,
            sample_tx: None,
            faults: FaultPlan::default(),
        }
    }
}

/// The simulated "air": a registry of sensor peripherals that also acts as
/// the transport connecting to them.
pub struct SimSensorNetwork {
    devices: Mutex<HashMap<BleAddress, SimDevice>>,
    disc_tx: broadcast::Sender<BleAddress>,
}

impl SimSensorNetwork {
    /// Create a new simulated network with no devices on it.
    pub fn new() -> Arc<Self> {
        let (disc_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            disc_tx,
        })
    }

    /// Put a peripheral on the network at the given address.
    pub fn add_device(&self, address: BleAddress) {
        let mut devices = self.devices.lock().unwrap();
        devices.insert(address, SimDevice::new());
    }

    /// Make the next operations of the given kind fail for this device.
    pub fn fail_connect(&self, address: &BleAddress, fail: bool) {
        self.with_device(address, |d| d.faults.connect = fail);
    }

    pub fn fail_configure(&self, address: &BleAddress, fail: bool) {
        self.with_device(address, |d| d.faults.configure = fail);
    }

    pub fn fail_subscribe(&self, address: &BleAddress, fail: bool) {
        self.with_device(address, |d| d.faults.subscribe = fail);
    }

    pub fn fail_disconnect(&self, address: &BleAddress, fail: bool) {
        self.with_device(address, |d| d.faults.disconnect = fail);
    }

    /// Deliver one accelerometer reading to the device's subscriber.
    /// Returns false when nothing is subscribed or the channel is full.
    pub fn push_sample(&self, address: &BleAddress, reading: AccelReading) -> bool {
        let devices = self.devices.lock().unwrap();
        match devices.get(address).and_then(|d| d.sample_tx.as_ref()) {
            Some(tx) => tx.try_send(reading).is_ok(),
            None => false,
        }
    }

    /// Simulate radio loss: the sample channel closes and an unsolicited
    /// disconnect notification is broadcast for the address.
    pub fn drop_link(&self, address: &BleAddress) {
        {
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.get_mut(address) {
                device.connected = false;
                device.sample_tx = None;
            }
        }
        debug!("sim: link dropped for {}", address);
        let _ = self.disc_tx.send(*address);
    }

    /// The configuration last applied to the device, if any.
    pub fn device_config(&self, address: &BleAddress) -> Option<SensorConfig> {
        let devices = self.devices.lock().unwrap();
        devices.get(address).and_then(|d| d.config)
    }

    /// Whether the device currently holds a connection.
    pub fn is_connected(&self, address: &BleAddress) -> bool {
        let devices = self.devices.lock().unwrap();
        devices.get(address).map(|d| d.connected).unwrap_or(false)
    }

    fn with_device(&self, address: &BleAddress, f: impl FnOnce(&mut SimDevice)) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(address) {
            f(device);
        }
    }
}

impl DeviceRegistry for SimSensorNetwork {
    fn resolve(&self, address: &BleAddress) -> Option<DeviceHandle> {
        let devices = self.devices.lock().unwrap();
        if devices.contains_key(address) {
            Some(DeviceHandle::new(*address))
        } else {
            None
        }
    }
}

#[async_trait]
impl SensorTransport for SimSensorNetwork {
    async fn connect(&self, handle: &DeviceHandle) -> Result<(), BleError> {
        let address = handle.address();
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&address)
            .ok_or_else(|| BleError::ConnectionError(format!("unknown device {}", address)))?;
        if device.faults.connect {
            return Err(BleError::ConnectionError("simulated connect failure".into()));
        }
        device.connected = true;
        debug!("sim: connected to {}", address);
        Ok(())
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), BleError> {
        let address = handle.address();
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&address)
            .ok_or_else(|| BleError::ConnectionError(format!("unknown device {}", address)))?;
        if device.faults.disconnect {
            return Err(BleError::ConnectionError(
                "simulated disconnect failure".into(),
            ));
        }
        device.connected = false;
        device.sample_tx = None;
        debug!("sim: disconnected from {}", address);
        Ok(())
    }

    fn configure(&self, handle: &DeviceHandle, config: &SensorConfig) -> Result<(), BleError> {
        let address = handle.address();
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&address)
            .ok_or_else(|| BleError::GattError(format!("unknown device {}", address)))?;
        if !device.connected {
            return Err(BleError::Disconnected);
        }
        if device.faults.configure {
            return Err(BleError::GattError("simulated configure failure".into()));
        }
        device.config = Some(*config);
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &DeviceHandle,
    ) -> Result<mpsc::Receiver<AccelReading>, BleError> {
        let address = handle.address();
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&address)
            .ok_or_else(|| BleError::GattError(format!("unknown device {}", address)))?;
        if !device.connected {
            return Err(BleError::Disconnected);
        }
        if device.faults.subscribe {
            return Err(BleError::GattError("simulated subscribe failure".into()));
        }
        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        device.sample_tx = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&self, handle: &DeviceHandle) {
        // Best-effort: dropping the sender closes the notification channel.
        self.with_device(&handle.address(), |d| d.sample_tx = None);
    }

    fn disconnects(&self) -> broadcast::Receiver<BleAddress> {
        self.disc_tx.subscribe()
    }
}
