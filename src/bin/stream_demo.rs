// src/bin/stream_demo.rs
//! Runs a full streaming session against the simulated sensor network:
//! start, a few seconds of gravity-like accelerometer samples into a CSV
//! file, then stop. Pass an output directory as the first argument
//! (defaults to the system temp dir).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

use accelstream::ble::simulated::SimSensorNetwork;
use accelstream::{AccelReading, BleAddress, SensorConfig, SensorSession, SessionConfig};

const DEMO_ADDRESS: &str = "F2:FC:66:32:11:51";
const STREAM_SECONDS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let address: BleAddress = DEMO_ADDRESS.parse()?;
    let sensor = SensorConfig::default();

    let network = SimSensorNetwork::new();
    network.add_device(address);

    let session = SensorSession::new(
        SessionConfig {
            address,
            sensor,
            output_dir,
        },
        network.clone(),
        network.clone(),
    );

    // Feed the simulated peripheral at the configured output data rate:
    // gravity on z with a small wobble on each axis.
    let feeder = {
        let network = network.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs_f64(1.0 / sensor.odr_hz as f64);
            let mut t = 0.0f64;
            loop {
                sleep(period).await;
                t += period.as_secs_f64();
                let reading = AccelReading::new(
                    0.02 * (t * 3.1).sin(),
                    0.02 * (t * 2.3).cos(),
                    9.8 + 0.05 * (t * 5.7).sin(),
                );
                network.push_sample(&address, reading);
            }
        })
    };

    println!("{}", session.start().await?);
    sleep(Duration::from_secs(STREAM_SECONDS)).await;
    println!("{}", session.stop().await?);

    feeder.abort();
    Ok(())
}
