// Accelstream - BLE accelerometer streaming sessions

pub mod ble;
pub mod session;
pub mod storage;

pub use ble::transport::{
    AccelReading, BleAddress, DeviceHandle, DeviceRegistry, SensorConfig, SensorTransport,
};
pub use ble::BleError;
pub use session::{SensorSession, SessionConfig, SessionError, SessionState};
pub use storage::csv_sink::CsvSink;
