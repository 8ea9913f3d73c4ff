//! Sensor session state machine
//!
//! One [`SensorSession`] owns the lifecycle of a logical connection to a
//! single fixed-address BLE peripheral: resolve, connect, configure, stream
//! samples into a CSV sink, disconnect. All state transitions are serialized
//! behind one async mutex, so transport callbacks arriving on arbitrary
//! tasks can never interleave with an in-flight start or stop.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::ble::transport::{
    AccelReading, BleAddress, DeviceHandle, DeviceRegistry, SensorConfig, SensorTransport,
};
use crate::storage::csv_sink::CsvSink;

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No connection; the only state `start()` is legal from.
    Idle,
    /// Connect request issued to the transport.
    Connecting,
    /// Connected; opening the sink and applying the sensor configuration.
    Configuring,
    /// Subscribed; samples are being appended to the sink.
    Streaming,
    /// Disconnect request issued to the transport.
    Stopping,
    /// A collaborator failed during the current attempt. Always resolves
    /// back to `Idle` before the failed call returns; never sticky.
    Faulted,
}

/// Session errors. Collaborator failures carry the underlying message
/// verbatim and are terminal for the current attempt only.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device not found: {0}")]
    DeviceNotFound(BleAddress),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("configure failed: {0}")]
    ConfigureFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("start not allowed from {0:?}")]
    NotIdle(SessionState),
}

/// Injected session configuration. The peripheral address is configuration,
/// not a global, so sessions and tests can target different devices.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: BleAddress,
    pub sensor: SensorConfig,
    /// Directory the CSV sink files are created in. Must already exist for
    /// persistence to be available; a missing directory downgrades the
    /// session to streaming without persistence.
    pub output_dir: PathBuf,
}

struct Inner {
    state: SessionState,
    handle: Option<DeviceHandle>,
    sink: Option<CsvSink>,
    sample_count: u64,
}

/// A streaming session against one fixed-address accelerometer peripheral.
pub struct SensorSession {
    config: SessionConfig,
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn SensorTransport>,
    inner: Arc<Mutex<Inner>>,
}

impl SensorSession {
    pub fn new(
        config: SessionConfig,
        registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn SensorTransport>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                handle: None,
                sink: None,
                sample_count: 0,
            })),
        }
    }

    /// Connect, configure and begin streaming.
    ///
    /// Legal only from `Idle`. Resolves exactly once: with a summary string
    /// after the subscription is live, or with the first collaborator error,
    /// after which the session is back in `Idle` and reusable.
    pub async fn start(&self) -> Result<String, SessionError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Idle {
                return Err(SessionError::NotIdle(inner.state));
            }
            // Resolution is a local lookup; failure leaves the state untouched.
            let handle = self
                .registry
                .resolve(&self.config.address)
                .ok_or(SessionError::DeviceNotFound(self.config.address))?;
            info!("connecting to {}", self.config.address);
            inner.state = SessionState::Connecting;
            inner.handle = Some(handle.clone());
            inner.sample_count = 0;
            handle
        };

        if let Err(e) = self.transport.connect(&handle).await {
            self.fail_attempt("connect").await;
            return Err(SessionError::ConnectFailed(e.to_string()));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Configuring;
            // Persistence is best-effort: a missing sink never blocks sensing.
            // The slot is always replaced, so a sink abandoned by an earlier
            // link loss is released here instead of inherited by this attempt.
            inner.sink = match CsvSink::create(&self.config.output_dir) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!("sink unavailable, streaming without persistence: {}", e);
                    None
                }
            };
        }

        if let Err(e) = self.transport.configure(&handle, &self.config.sensor) {
            self.fail_attempt("configure").await;
            return Err(SessionError::ConfigureFailed(e.to_string()));
        }

        let samples = match self.transport.subscribe(&handle).await {
            Ok(rx) => rx,
            Err(e) => {
                self.fail_attempt("subscribe").await;
                return Err(SessionError::SubscribeFailed(e.to_string()));
            }
        };
        let disconnects = self.transport.disconnects();

        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Streaming;
        }
        tokio::spawn(Self::pump(
            Arc::clone(&self.inner),
            Arc::clone(&self.transport),
            self.config.address,
            samples,
            disconnects,
        ));

        info!(
            "streaming from {} at {} Hz (±{} g)",
            self.config.address, self.config.sensor.odr_hz, self.config.sensor.range_g
        );
        Ok(format!(
            "connected to {}, accelerometer streaming",
            self.config.address
        ))
    }

    /// Unsubscribe, disconnect and close the sink.
    ///
    /// Legal from `Streaming`; from any other state it is a warning no-op
    /// with a benign result. Teardown always completes — sink closed, state
    /// back to `Idle` — before a disconnect failure is reported.
    pub async fn stop(&self) -> Result<String, SessionError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Streaming {
                warn!("stop requested while {:?}; nothing to stop", inner.state);
                return Ok(format!("no active stream (state {:?})", inner.state));
            }
            let Some(handle) = inner.handle.take() else {
                inner.state = SessionState::Idle;
                return Ok("no active stream".to_string());
            };
            self.transport.unsubscribe(&handle);
            inner.state = SessionState::Stopping;
            handle
        };

        let result = self.transport.disconnect(&handle).await;

        let sample_count = {
            let mut inner = self.inner.lock().await;
            if let Some(sink) = inner.sink.take() {
                sink.close();
            }
            inner.state = SessionState::Idle;
            inner.sample_count
        };

        match result {
            Ok(()) => {
                info!(
                    "disconnected from {} after {} samples",
                    self.config.address, sample_count
                );
                Ok(format!("disconnected after {} samples", sample_count))
            }
            Err(e) => Err(SessionError::DisconnectFailed(e.to_string())),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Samples accepted since the last `start()`. Diagnostic only.
    pub async fn sample_count(&self) -> u64 {
        self.inner.lock().await.sample_count
    }

    /// Path of the sink the current attempt writes to, or `None` when the
    /// session streams without persistence.
    pub async fn sink_path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .await
            .sink
            .as_ref()
            .map(|sink| sink.path().to_path_buf())
    }

    /// Resolve a failed attempt: close the sink, release the handle and
    /// return to `Idle` so the session stays reusable.
    async fn fail_attempt(&self, during: &str) {
        error!("session attempt to {} failed during {}", self.config.address, during);
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Faulted;
        if let Some(sink) = inner.sink.take() {
            sink.close();
        }
        inner.handle = None;
        inner.state = SessionState::Idle;
    }

    /// Streaming loop: stamps each reading with wall-clock arrival time and
    /// appends it to the sink, strictly while the state is `Streaming`.
    async fn pump(
        inner: Arc<Mutex<Inner>>,
        transport: Arc<dyn SensorTransport>,
        address: BleAddress,
        mut samples: mpsc::Receiver<AccelReading>,
        mut disconnects: broadcast::Receiver<BleAddress>,
    ) {
        loop {
            tokio::select! {
                reading = samples.recv() => match reading {
                    Some(reading) => {
                        if !Self::record_sample(&inner, reading).await {
                            break;
                        }
                    }
                    None => {
                        // The notification channel closed. After an explicit
                        // stop the state has already moved on; while still
                        // Streaming it means the link dropped under us.
                        let mut inner = inner.lock().await;
                        if inner.state == SessionState::Streaming {
                            Self::handle_link_loss(&mut inner, &transport, address);
                        }
                        break;
                    }
                },
                lost = disconnects.recv() => match lost {
                    Ok(addr) if addr == address => {
                        let mut inner = inner.lock().await;
                        if inner.state == SessionState::Streaming {
                            Self::handle_link_loss(&mut inner, &transport, address);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("missed {} disconnect notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // No more disconnect notifications; drain the sample
                        // channel until the transport closes it.
                        while let Some(reading) = samples.recv().await {
                            if !Self::record_sample(&inner, reading).await {
                                break;
                            }
                        }
                        break;
                    }
                },
            }
        }
    }

    /// Returns false once the session has left `Streaming`.
    async fn record_sample(inner: &Arc<Mutex<Inner>>, reading: AccelReading) -> bool {
        let mut inner = inner.lock().await;
        if inner.state != SessionState::Streaming {
            return false;
        }
        inner.sample_count += 1;
        let at = Local::now();
        if let Some(sink) = inner.sink.as_mut() {
            if let Err(e) = sink.append(at, &reading) {
                // Best-effort persistence: log and keep streaming.
                warn!("sample dropped by sink: {}", e);
            }
        }
        true
    }

    /// Unsolicited disconnect: the link is already gone, so this is local
    /// cleanup only. The sink is deliberately not closed here — it is
    /// abandoned in place and its handle released when the next `start()`
    /// replaces it or the process exits.
    fn handle_link_loss(
        inner: &mut Inner,
        transport: &Arc<dyn SensorTransport>,
        address: BleAddress,
    ) {
        warn!("unsolicited disconnect from {}", address);
        if let Some(handle) = inner.handle.take() {
            transport.unsubscribe(&handle);
        }
        inner.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimSensorNetwork;
    use std::path::Path;
    use std::time::Duration;

    fn device_address() -> BleAddress {
        "F2:FC:66:32:11:51".parse().unwrap()
    }

    fn make_session(output_dir: &Path) -> (Arc<SimSensorNetwork>, SensorSession) {
        let address = device_address();
        let network = SimSensorNetwork::new();
        network.add_device(address);
        let config = SessionConfig {
            address,
            sensor: SensorConfig::default(),
            output_dir: output_dir.to_path_buf(),
        };
        let session = SensorSession::new(config, network.clone(), network.clone());
        (network, session)
    }

    async fn wait_for_samples(session: &SensorSession, n: u64) {
        for _ in 0..200 {
            if session.sample_count().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} samples", n);
    }

    async fn wait_for_state(session: &SensorSession, state: SessionState) {
        for _ in 0..200 {
            if session.state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for state {:?}", state);
    }

    fn sink_file_in(dir: &Path) -> PathBuf {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1, "expected exactly one sink file");
        files.pop().unwrap()
    }

    #[tokio::test]
    async fn test_start_reaches_streaming_and_configures_device() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());

        let message = session.start().await.unwrap();
        assert!(message.contains("streaming"));
        assert_eq!(session.state().await, SessionState::Streaming);
        assert!(network.is_connected(&device_address()));
        assert_eq!(
            network.device_config(&device_address()),
            Some(SensorConfig::default())
        );
    }

    #[tokio::test]
    async fn test_start_rejected_while_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let (_network, session) = make_session(dir.path());

        session.start().await.unwrap();
        match session.start().await {
            Err(SessionError::NotIdle(SessionState::Streaming)) => {}
            other => panic!("expected NotIdle(Streaming), got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state().await, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_unknown_device_rejects_and_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let address = device_address();
        let network = SimSensorNetwork::new();
        // Nothing registered at the session's address.
        let config = SessionConfig {
            address,
            sensor: SensorConfig::default(),
            output_dir: dir.path().to_path_buf(),
        };
        let session = SensorSession::new(config, network.clone(), network.clone());

        match session.start().await {
            Err(SessionError::DeviceNotFound(a)) => assert_eq!(a, address),
            other => panic!("expected DeviceNotFound, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle_and_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        network.fail_connect(&address, true);
        match session.start().await {
            Err(SessionError::ConnectFailed(msg)) => {
                assert!(msg.contains("simulated connect failure"));
            }
            other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state().await, SessionState::Idle);

        // Faulted is per-attempt only; the same session starts cleanly.
        network.fail_connect(&address, false);
        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_configure_failure_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        network.fail_configure(&device_address(), true);

        match session.start().await {
            Err(SessionError::ConfigureFailed(_)) => {}
            other => panic!("expected ConfigureFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_subscribe_failure_returns_to_idle_with_sink_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();
        network.fail_subscribe(&address, true);

        match session.start().await {
            Err(SessionError::SubscribeFailed(msg)) => {
                assert!(msg.contains("simulated subscribe failure"));
            }
            other => panic!("expected SubscribeFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state().await, SessionState::Idle);

        // The sink opened during Configuring was closed by the teardown:
        // the file holds only its header and the session restarts cleanly.
        let file = sink_file_in(dir.path());
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content, "timestamp,x,y,z\n");

        network.fail_subscribe(&address, false);
        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_streaming_appends_rows_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        session.start().await.unwrap();
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        assert!(network.push_sample(&address, AccelReading::new(0.1, 0.0, 9.7)));
        wait_for_samples(&session, 2).await;

        session.stop().await.unwrap();

        let file = sink_file_in(dir.path());
        let content = std::fs::read_to_string(&file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,x,y,z");
        assert!(lines[1].ends_with(",0.0000,0.0000,9.8000"));
        assert!(lines[2].ends_with(",0.1000,0.0000,9.7000"));
    }

    #[tokio::test]
    async fn test_sink_open_failure_streams_without_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");
        let address = device_address();
        let network = SimSensorNetwork::new();
        network.add_device(address);
        let config = SessionConfig {
            address,
            sensor: SensorConfig::default(),
            output_dir: missing,
        };
        let session = SensorSession::new(config, network.clone(), network.clone());

        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        wait_for_samples(&session, 1).await;
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_benign_no_op_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (_network, session) = make_session(dir.path());

        let message = session.stop().await.unwrap();
        assert!(message.contains("no active stream"));
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_completes_teardown_even_when_disconnect_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        session.start().await.unwrap();
        network.fail_disconnect(&address, true);

        match session.stop().await {
            Err(SessionError::DisconnectFailed(msg)) => {
                assert!(msg.contains("simulated disconnect failure"));
            }
            other => panic!("expected DisconnectFailed, got {:?}", other.map(|_| ())),
        }
        // Teardown finished regardless: sink closed, state reset.
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_no_samples_recorded_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        session.start().await.unwrap();
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        wait_for_samples(&session, 1).await;
        session.stop().await.unwrap();

        // The stop unsubscribed; the transport refuses further delivery.
        assert!(!network.push_sample(&address, AccelReading::new(1.0, 1.0, 1.0)));
        assert_eq!(session.sample_count().await, 1);

        let file = sink_file_in(dir.path());
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_reaches_idle_with_rows_intact() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        session.start().await.unwrap();
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        assert!(network.push_sample(&address, AccelReading::new(0.1, 0.0, 9.7)));
        assert!(network.push_sample(&address, AccelReading::new(-0.1, 0.1, 9.9)));
        wait_for_samples(&session, 3).await;

        network.drop_link(&address);
        wait_for_state(&session, SessionState::Idle).await;

        // No further writes after the link loss.
        assert!(!network.push_sample(&address, AccelReading::new(5.0, 5.0, 5.0)));
        assert_eq!(session.sample_count().await, 3);

        let file = sink_file_in(dir.path());
        let content = std::fs::read_to_string(&file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,x,y,z");
        assert!(lines[1].ends_with(",0.0000,0.0000,9.8000"));
        assert!(lines[2].ends_with(",0.1000,0.0000,9.7000"));
        assert!(lines[3].ends_with(",-0.1000,0.1000,9.9000"));
    }

    #[tokio::test]
    async fn test_failed_sink_reopen_after_link_loss_releases_stale_sink() {
        let base = tempfile::tempdir().unwrap();
        let output_dir = base.path().join("out");
        std::fs::create_dir(&output_dir).unwrap();
        let (network, session) = make_session(&output_dir);
        let address = device_address();

        session.start().await.unwrap();
        assert!(session.sink_path().await.is_some());
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        wait_for_samples(&session, 1).await;
        network.drop_link(&address);
        wait_for_state(&session, SessionState::Idle).await;

        // Take the output directory away so the sink reopen fails.
        std::fs::remove_dir_all(&output_dir).unwrap();

        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);
        // The attempt streams without persistence; the sink abandoned by
        // the link loss was released, not inherited.
        assert_eq!(session.sink_path().await, None);

        assert!(network.push_sample(&address, AccelReading::new(1.0, 1.0, 1.0)));
        wait_for_samples(&session, 1).await;
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_restarts_after_unsolicited_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (network, session) = make_session(dir.path());
        let address = device_address();

        session.start().await.unwrap();
        network.drop_link(&address);
        wait_for_state(&session, SessionState::Idle).await;

        // The abandoned sink is replaced by the next start.
        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);
        assert!(network.push_sample(&address, AccelReading::new(0.0, 0.0, 9.8)));
        wait_for_samples(&session, 1).await;
        session.stop().await.unwrap();
    }
}
