//! TCP link to the microscope control server.
//!
//! [`DeviceConnection`] owns at most one socket. Every exchange (command word,
//! payload, response) runs while holding a single async mutex scoped to the
//! connection, so heartbeats, reconnection and caller commands never interleave
//! bytes on the wire.
//!
//! Socket failures all take one path: the socket is dropped, the state becomes
//! `Disconnected`, a reconnection is scheduled on the background worker and the
//! error is returned to the caller as a connectivity error. Hardware-fault
//! replies are not socket failures and leave the link up.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ErrorKind, ScopeError, ScopeResult};
use crate::protocol::codec::{self, StatusReply, STATUS_FRAME_LEN};
use crate::protocol::{AcquisitionCommand, Command};

use super::reconnect::{ConnectionState, HealthConfig, HealthStatus, ReconnectConfig};

/// How long a secondary read waits for more bytes of a variable-length reply.
const TRAILING_READ_WINDOW: Duration = Duration::from_millis(100);

/// Upper bound on the diagnostic text read after a sentinel.
const MAX_TRAILING_BYTES: usize = 4096;

/// Settings for one [`DeviceConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// TCP handshake timeout
    pub connect_timeout: Duration,
    /// Per-read timeout
    pub read_timeout: Duration,
    /// Pause between the `acquire_` word and its text payload
    pub acquire_payload_delay: Duration,
    /// Reconnection behavior
    pub reconnect: ReconnectConfig,
    /// Idle heartbeat behavior
    pub health: HealthConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl ConnectionConfig {
    /// Defaults for the given server address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerConfig> for ConnectionConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            connect_timeout: server.connect_timeout,
            read_timeout: server.read_timeout,
            acquire_payload_delay: server.acquire_payload_delay,
            reconnect: ReconnectConfig {
                delay: server.reconnect_delay,
                max_attempts: server.max_reconnect_attempts,
                enabled: server.max_reconnect_attempts > 0,
            },
            health: HealthConfig {
                interval: server.health_check_interval,
                enabled: true,
            },
        }
    }
}

/// Handle to the single logical link to the hardware server.
///
/// Cloning is cheap and every clone refers to the same socket. Background
/// workers start on the first [`connect`](Self::connect) and stop when the last
/// handle is dropped or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    /// Execution lock; `None` while disconnected.
    stream: Mutex<Option<TcpStream>>,
    state: watch::Sender<ConnectionState>,
    last_activity: SyncMutex<Instant>,
    health: SyncMutex<HealthStatus>,
    shutting_down: AtomicBool,
    /// Set when the last reconnection loop gave up; cleared by a successful connect.
    exhausted: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    reconnect_tx: mpsc::UnboundedSender<()>,
    reconnect_rx: SyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("address", &self.inner.config.address())
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    /// Create a disconnected handle. No I/O happens until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                stream: Mutex::new(None),
                state,
                last_activity: SyncMutex::new(Instant::now()),
                health: SyncMutex::new(HealthStatus::default()),
                shutting_down: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_tx,
                reconnect_rx: SyncMutex::new(Some(reconnect_rx)),
                tasks: SyncMutex::new(Vec::new()),
            }),
        }
    }

    /// Connection settings.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns true if a socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Reconnection attempts made since this connection was created.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Time of the last successful exchange.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    /// Snapshot of heartbeat bookkeeping.
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        self.inner.health.lock().clone()
    }

    /// Open the socket. No-op if already connected.
    ///
    /// A successful connect also clears the fail-fast state left behind by an
    /// exhausted reconnection loop.
    pub async fn connect(&self) -> ScopeResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ScopeError::Closed);
        }
        self.start_workers();
        self.open_locked().await
    }

    /// Run one command under the execution lock.
    ///
    /// Writes the command word and `payload`, then reads exactly
    /// `expected_len` bytes if non-zero. A reply starting with the
    /// hardware-fault sentinel becomes [`ScopeError::HardwareFault`] and the
    /// connection stays up; every socket failure disconnects and schedules
    /// reconnection.
    pub async fn execute_command(
        &self,
        cmd: Command,
        payload: &[u8],
        expected_len: usize,
    ) -> ScopeResult<Vec<u8>> {
        self.ensure_connected().await?;

        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(ScopeError::Connection(format!(
                "Not connected; '{cmd}' was not sent"
            )));
        };

        let result = exchange(
            stream,
            cmd,
            payload,
            expected_len,
            self.inner.config.read_timeout,
        )
        .await;

        match result {
            Err(err) if err.kind() == ErrorKind::Connectivity => {
                *guard = None;
                drop(guard);
                Err(self.handle_io_error(cmd, expected_len, err))
            }
            other => {
                self.touch();
                other
            }
        }
    }

    /// Current stage X,Y in micrometers.
    pub async fn get_stage_xy(&self) -> ScopeResult<(f32, f32)> {
        let values = self.query_floats(Command::GetStageXY, 2).await?;
        Ok((values[0], values[1]))
    }

    /// Current stage Z in micrometers.
    pub async fn get_stage_z(&self) -> ScopeResult<f32> {
        Ok(self.query_floats(Command::GetStageZ, 1).await?[0])
    }

    /// Current rotation position in ticks.
    pub async fn get_rotation(&self) -> ScopeResult<f32> {
        Ok(self.query_floats(Command::GetRotation, 1).await?[0])
    }

    /// Camera field of view (width, height) in micrometers.
    pub async fn get_field_of_view(&self) -> ScopeResult<(f32, f32)> {
        let values = self.query_floats(Command::GetFieldOfView, 2).await?;
        Ok((values[0], values[1]))
    }

    /// Move the stage in X,Y. Returns once the command is written.
    pub async fn move_stage_xy(&self, x: f32, y: f32) -> ScopeResult<()> {
        info!("Moving stage to X={}, Y={}", x, y);
        self.execute_command(Command::MoveStageXY, &codec::encode_f32s(&[x, y]), 0)
            .await
            .map(|_| ())
    }

    /// Move the stage in Z.
    pub async fn move_stage_z(&self, z: f32) -> ScopeResult<()> {
        info!("Moving stage to Z={}", z);
        self.execute_command(Command::MoveStageZ, &codec::encode_f32(z), 0)
            .await
            .map(|_| ())
    }

    /// Move the rotation axis to `ticks`.
    pub async fn move_rotation(&self, ticks: f32) -> ScopeResult<()> {
        info!("Moving rotation stage to {} ticks", ticks);
        self.execute_command(Command::MoveRotation, &codec::encode_f32(ticks), 0)
            .await
            .map(|_| ())
    }

    /// Start an acquisition job.
    ///
    /// The command word and the text message are written as two separate
    /// writes, `acquire_payload_delay` apart, without releasing the lock.
    pub async fn start_acquisition(&self, command: &AcquisitionCommand) -> ScopeResult<()> {
        let message = command.encode()?;
        self.ensure_connected().await?;

        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(ScopeError::Connection(
                "Not connected; acquisition was not started".into(),
            ));
        };

        let result = send_acquire(
            stream,
            message.as_bytes(),
            self.inner.config.acquire_payload_delay,
        )
        .await;

        match result {
            Ok(()) => {
                self.touch();
                info!(region = command.region(), "Acquisition started");
                debug!("Acquisition message: {}", message);
                Ok(())
            }
            Err(err) => {
                *guard = None;
                drop(guard);
                Err(self.handle_io_error(Command::Acquire, 0, err))
            }
        }
    }

    /// Poll the acquisition status.
    pub async fn acquisition_status(&self) -> ScopeResult<StatusReply> {
        let bytes = self
            .execute_command(Command::Status, &[], STATUS_FRAME_LEN)
            .await?;
        Ok(codec::decode_status(&bytes))
    }

    /// Poll acquisition progress as (completed files, total files).
    pub async fn acquisition_progress(&self) -> ScopeResult<(u32, u32)> {
        let cmd = Command::Progress;
        let bytes = self.execute_command(cmd, &[], cmd.response_len()).await?;
        let values = codec::decode_i32s(cmd, &bytes, 2)?;
        let clamp = |v: i32| u32::try_from(v).unwrap_or(0);
        Ok((clamp(values[0]), clamp(values[1])))
    }

    /// Ask the server to cancel the running acquisition.
    ///
    /// Returns whether the server acknowledged. Cancellation completes when a
    /// later status poll reports `CANCELLED`.
    pub async fn cancel_acquisition(&self) -> ScopeResult<bool> {
        let bytes = self
            .execute_command(Command::Cancel, &[], codec::ACK.len())
            .await?;
        let acknowledged = bytes == codec::ACK;
        if acknowledged {
            info!("Cancellation acknowledged by server");
        } else {
            warn!(
                "Unexpected cancel reply: {:?}",
                String::from_utf8_lossy(&bytes)
            );
        }
        Ok(acknowledged)
    }

    /// Close the socket gracefully. The next command reconnects on demand.
    pub async fn disconnect(&self) -> ScopeResult<()> {
        let mut guard = self.inner.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            if let Err(e) = write_frame(&mut stream, Command::Disconnect, &[]).await {
                debug!("Could not send disconnect: {}", e);
            }
            let _ = stream.shutdown().await;
            info!("Disconnected from {}", self.inner.config.address());
        }
        drop(guard);
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Terminate the server process, then drop the socket.
    ///
    /// Commands fail fast afterwards until [`connect`](Self::connect) succeeds.
    pub async fn shutdown_server(&self) -> ScopeResult<()> {
        self.execute_command(Command::Shutdown, &[], 0).await?;
        warn!("Shutdown command sent to {}", self.inner.config.address());
        self.inner.stream.lock().await.take();
        self.inner.exhausted.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Stop background workers and close the socket. Terminal.
    pub async fn close(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let mut guard = self.inner.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = write_frame(&mut stream, Command::Disconnect, &[]).await;
            let _ = stream.shutdown().await;
        }
        drop(guard);
        self.inner.state.send_replace(ConnectionState::Closed);
        info!("Connection to {} closed", self.inner.config.address());
    }

    async fn query_floats(&self, cmd: Command, count: usize) -> ScopeResult<Vec<f32>> {
        let bytes = self.execute_command(cmd, &[], count * 4).await?;
        codec::decode_f32s(cmd, &bytes, count)
    }

    async fn ensure_connected(&self) -> ScopeResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ScopeError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        let reconnect = &self.inner.config.reconnect;
        if self.inner.exhausted.load(Ordering::SeqCst) {
            debug!("Failing fast: reconnection exhausted");
            return Err(ScopeError::ReconnectExhausted {
                attempts: reconnect.max_attempts,
            });
        }
        if !reconnect.should_retry(0) {
            return Err(ScopeError::Connection(format!(
                "Not connected to {}",
                self.inner.config.address()
            )));
        }

        self.start_workers();
        let mut state_rx = self.inner.state.subscribe();
        self.request_reconnect();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ScopeError::Closed),
                _ if self.inner.exhausted.load(Ordering::SeqCst) => {
                    return Err(ScopeError::ReconnectExhausted {
                        attempts: reconnect.max_attempts,
                    })
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ScopeError::Closed);
            }
        }
    }

    async fn open_locked(&self) -> ScopeResult<()> {
        let mut guard = self.inner.stream.lock().await;
        if guard.is_some() {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return Ok(());
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ScopeError::Closed);
        }

        let stream = open_socket(&self.inner.config).await?;
        *guard = Some(stream);
        drop(guard);

        self.inner.exhausted.store(false, Ordering::SeqCst);
        // Cleared before Connected is published so a failure right after the
        // reopen can schedule the next reconnection.
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.touch();
        self.set_state(ConnectionState::Connected);
        info!(
            "Connected to microscope server at {}",
            self.inner.config.address()
        );
        Ok(())
    }

    fn handle_io_error(&self, cmd: Command, expected_len: usize, err: ScopeError) -> ScopeError {
        error!(
            command = %cmd,
            expected_bytes = expected_len,
            "Communication failure, marking connection disconnected: {}",
            err
        );
        self.set_state(ConnectionState::Disconnected);
        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            self.request_reconnect();
        }
        err
    }

    fn request_reconnect(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst)
            || self.inner.exhausted.load(Ordering::SeqCst)
            || !self.inner.config.reconnect.should_retry(0)
        {
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            && self.inner.reconnect_tx.send(()).is_err()
        {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    async fn run_reconnect_loop(&self) {
        let reconnect = self.inner.config.reconnect.clone();
        let address = self.inner.config.address();
        let mut attempt = 0;

        while reconnect.should_retry(attempt) {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                self.inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            attempt += 1;
            let delay = reconnect.delay_for_attempt(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            info!(
                "Reconnect attempt {} of {} in {:.1}s",
                attempt,
                reconnect.max_attempts,
                delay.as_secs_f64()
            );
            sleep(delay).await;

            self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            match self.open_locked().await {
                Ok(()) => {
                    info!("Reconnected to {} after {} attempt(s)", address, attempt);
                    return;
                }
                Err(ScopeError::Closed) => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            attempts = attempt,
            "Giving up on {}; commands will fail until connect() succeeds", address
        );
        self.inner.exhausted.store(true, Ordering::SeqCst);
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn heartbeat_if_idle(&self, interval: Duration) {
        if !self.is_connected() {
            return;
        }
        let idle = self.last_activity().elapsed();
        if idle < interval {
            return;
        }

        debug!(idle_ms = idle.as_millis() as u64, "Connection idle, sending heartbeat");
        let now = Instant::now();
        match self.get_stage_xy().await {
            Ok(_) => self.inner.health.lock().record_success(now),
            Err(ScopeError::HardwareFault(detail)) => {
                warn!("Heartbeat reached the server but the stage reports: {}", detail);
                self.inner.health.lock().record_success(now);
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
                self.inner.health.lock().record_failure(now, e.to_string());
            }
        }
    }

    fn start_workers(&self) {
        let Some(rx) = self.inner.reconnect_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(reconnect_worker(weak.clone(), rx)));
        if self.inner.config.health.enabled {
            tasks.push(tokio::spawn(health_monitor(
                weak,
                self.inner.config.health.interval,
            )));
        }
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn reconnect_worker(weak: Weak<Inner>, mut requests: mpsc::UnboundedReceiver<()>) {
    while requests.recv().await.is_some() {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        DeviceConnection { inner }.run_reconnect_loop().await;
    }
    debug!("Reconnection worker stopped");
}

async fn health_monitor(weak: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        DeviceConnection { inner }.heartbeat_if_idle(interval).await;
    }
    debug!("Health monitor stopped");
}

async fn open_socket(config: &ConnectionConfig) -> ScopeResult<TcpStream> {
    let address = config.address();
    let connect = async {
        let addr = lookup_host(address.as_str())
            .await
            .map_err(|e| connect_error(&address, e))?
            .next()
            .ok_or_else(|| ScopeError::Connection(format!("No address found for {address}")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = socket.map_err(|e| connect_error(&address, e))?;
        socket
            .set_keepalive(true)
            .map_err(|e| connect_error(&address, e))?;

        let stream = socket
            .connect(addr)
            .await
            .map_err(|e| connect_error(&address, e))?;
        // Small protocol frames must not wait on Nagle coalescing.
        stream
            .set_nodelay(true)
            .map_err(|e| connect_error(&address, e))?;
        Ok::<_, ScopeError>(stream)
    };

    match timeout(config.connect_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(ScopeError::Timeout {
            operation: format!("connect to {address}"),
            after: config.connect_timeout,
        }),
    }
}

fn connect_error(address: &str, e: std::io::Error) -> ScopeError {
    ScopeError::Connection(format!("Failed to connect to {address}: {e}"))
}

async fn exchange(
    stream: &mut TcpStream,
    cmd: Command,
    payload: &[u8],
    expected_len: usize,
    read_timeout: Duration,
) -> ScopeResult<Vec<u8>> {
    write_frame(stream, cmd, payload).await?;
    if expected_len == 0 {
        return Ok(Vec::new());
    }

    let mut response = if cmd == Command::Status {
        read_status_frame(stream, expected_len, read_timeout).await?
    } else {
        read_response(stream, cmd, expected_len, read_timeout).await?
    };

    if codec::is_fault_prefix(&response) {
        response.extend(read_trailing(stream).await);
        if codec::is_hardware_fault(&response) {
            let detail = codec::hardware_fault_text(&response);
            warn!(
                command = %cmd,
                expected_bytes = expected_len,
                actual_bytes = response.len(),
                "Hardware fault reported: {}",
                detail
            );
            return Err(ScopeError::HardwareFault(detail));
        }
        return Err(ScopeError::MalformedResponse {
            command: cmd.to_string(),
            expected: expected_len,
            actual: response.len(),
        });
    }

    if cmd == Command::Status && codec::status_has_text(&response) {
        response.extend(read_trailing(stream).await);
    }

    debug!(command = %cmd, bytes = response.len(), "Response received");
    Ok(response)
}

async fn write_frame(stream: &mut TcpStream, cmd: Command, payload: &[u8]) -> ScopeResult<()> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&codec::encode_command(cmd));
    frame.extend_from_slice(payload);

    stream
        .write_all(&frame)
        .await
        .map_err(|e| write_error(cmd, e))?;
    stream.flush().await.map_err(|e| write_error(cmd, e))?;

    debug!(command = %cmd, payload_bytes = payload.len(), "Command sent");
    Ok(())
}

async fn send_acquire(stream: &mut TcpStream, message: &[u8], delay: Duration) -> ScopeResult<()> {
    write_frame(stream, Command::Acquire, &[]).await?;
    sleep(delay).await;
    stream
        .write_all(message)
        .await
        .map_err(|e| write_error(Command::Acquire, e))?;
    stream
        .flush()
        .await
        .map_err(|e| write_error(Command::Acquire, e))?;
    debug!(bytes = message.len(), "Acquisition message sent");
    Ok(())
}

fn write_error(cmd: Command, e: std::io::Error) -> ScopeError {
    ScopeError::Connection(format!("Write failed for '{cmd}': {e}"))
}

async fn read_response(
    stream: &mut TcpStream,
    cmd: Command,
    expected_len: usize,
    read_timeout: Duration,
) -> ScopeResult<Vec<u8>> {
    let mut buf = vec![0u8; expected_len];
    let mut filled = 0;
    while filled < expected_len {
        match timeout(read_timeout, stream.read(&mut buf[filled..])).await {
            Err(_) => {
                return Err(ScopeError::Timeout {
                    operation: format!("'{cmd}' response ({filled} of {expected_len} bytes)"),
                    after: read_timeout,
                })
            }
            Ok(Ok(0)) if filled == 0 => {
                return Err(ScopeError::Connection(format!(
                    "Connection closed by server while waiting for '{cmd}'"
                )))
            }
            Ok(Ok(0)) => {
                return Err(ScopeError::MalformedResponse {
                    command: cmd.to_string(),
                    expected: expected_len,
                    actual: filled,
                })
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => {
                return Err(ScopeError::Connection(format!(
                    "Read failed for '{cmd}' after {filled} of {expected_len} bytes: {e}"
                )))
            }
        }
    }
    Ok(buf)
}

/// Sentinel replies carry text of any length and may be shorter than the
/// frame, so only the prefix is read before deciding how much more to expect.
async fn read_status_frame(
    stream: &mut TcpStream,
    frame_len: usize,
    read_timeout: Duration,
) -> ScopeResult<Vec<u8>> {
    let head_len = codec::STATUS_PREFIX_LEN.min(frame_len);
    let mut head = read_response(stream, Command::Status, head_len, read_timeout).await?;
    if codec::status_has_text(&head) || codec::is_fault_prefix(&head) {
        return Ok(head);
    }
    let rest = read_response(stream, Command::Status, frame_len - head_len, read_timeout).await?;
    head.extend(rest);
    Ok(head)
}

/// Bounded secondary read of whatever the server sent past a fixed frame.
async fn read_trailing(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 256];
    while out.len() < MAX_TRAILING_BYTES {
        match timeout(TRAILING_READ_WINDOW, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => out.extend_from_slice(&chunk[..n]),
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock_server::MockMicroscopeServer;
    use tracing_test::traced_test;

    fn test_config(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            read_timeout: Duration::from_millis(500),
            acquire_payload_delay: Duration::from_millis(5),
            reconnect: ReconnectConfig {
                delay: Duration::from_millis(20),
                max_attempts: 2,
                enabled: true,
            },
            health: HealthConfig {
                interval: Duration::from_secs(60),
                enabled: false,
            },
            ..ConnectionConfig::new("127.0.0.1", port)
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let server = MockMicroscopeServer::start().await.unwrap();
        let conn = DeviceConnection::new(test_config(server.port()));

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(server.connection_count(), 1);

        conn.close().await;
        server.stop();
    }

    #[tokio::test]
    async fn test_stage_queries_decode_big_endian() {
        let server = MockMicroscopeServer::start().await.unwrap();
        server.set_position(1250.5, -3000.25, 12.0);
        server.set_rotation(90.0);
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();

        assert_eq!(conn.get_stage_xy().await.unwrap(), (1250.5, -3000.25));
        assert_eq!(conn.get_stage_z().await.unwrap(), 12.0);
        assert_eq!(conn.get_rotation().await.unwrap(), 90.0);

        conn.move_stage_xy(100.0, 200.0).await.unwrap();
        conn.move_stage_z(-5.5).await.unwrap();
        assert_eq!(conn.get_stage_xy().await.unwrap(), (100.0, 200.0));
        assert_eq!(conn.get_stage_z().await.unwrap(), -5.5);

        conn.close().await;
        server.stop();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hardware_fault_keeps_connection() {
        let server = MockMicroscopeServer::start().await.unwrap();
        server.set_hardware_fault(Some("stage not loaded"));
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();

        let err = conn.get_stage_xy().await.unwrap_err();
        assert!(matches!(&err, ScopeError::HardwareFault(msg) if msg == "stage not loaded"));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.reconnect_attempts(), 0);
        assert!(logs_contain("Hardware fault reported"));

        // Link is still usable once the fault clears.
        server.set_hardware_fault(None);
        assert!(conn.get_stage_z().await.is_ok());

        conn.close().await;
        server.stop();
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_commands() {
        let server = MockMicroscopeServer::start().await.unwrap();
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.get_stage_xy().await, Err(ScopeError::Closed)));
        assert!(matches!(conn.connect().await, Err(ScopeError::Closed)));
        server.stop();
    }

    #[tokio::test]
    async fn test_disconnect_then_command_reconnects_on_demand() {
        let server = MockMicroscopeServer::start().await.unwrap();
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();

        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert!(conn.get_stage_xy().await.is_ok());
        assert!(conn.is_connected());
        assert_eq!(conn.reconnect_attempts(), 1);

        conn.close().await;
        server.stop();
    }

    /// Server that answers every `status__` with `reply`, unpadded.
    async fn raw_status_server(reply: &'static [u8]) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut word = [0u8; 8];
            while socket.read_exact(&mut word).await.is_ok() {
                if &word == b"status__" {
                    socket.write_all(reply).await.unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_short_failed_status_keeps_diagnostic() {
        let port = raw_status_server(b"FAILED:timeout").await;
        let conn = DeviceConnection::new(test_config(port));
        conn.connect().await.unwrap();

        let started = Instant::now();
        let reply = conn.acquisition_status().await.unwrap();
        assert_eq!(reply, StatusReply::Failed("timeout".into()));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_bare_success_status() {
        let port = raw_status_server(b"SUCCESS:").await;
        let conn = DeviceConnection::new(test_config(port));
        conn.connect().await.unwrap();

        assert_eq!(
            conn.acquisition_status().await.unwrap(),
            StatusReply::Success(String::new())
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_right_after_reconnect_is_recovered() {
        let server = MockMicroscopeServer::start().await.unwrap();
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();
        let mut states = conn.subscribe_state();

        for _ in 0..5 {
            // drop the link the moment it is reported up again
            conn.inner.stream.lock().await.take();
            let _ = conn.handle_io_error(
                Command::GetStageXY,
                8,
                ScopeError::Connection("reset by peer".into()),
            );
            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    if *states.borrow_and_update() == ConnectionState::Connected {
                        break;
                    }
                    states.changed().await.unwrap();
                }
            })
            .await
            .unwrap();
            assert!(!conn.inner.reconnecting.load(Ordering::SeqCst));
        }
        assert_eq!(conn.reconnect_attempts(), 5);

        conn.close().await;
        server.stop();
    }

    #[tokio::test]
    async fn test_field_of_view_and_cancel_ack() {
        let server = MockMicroscopeServer::start().await.unwrap();
        let conn = DeviceConnection::new(test_config(server.port()));
        conn.connect().await.unwrap();

        let (w, h) = conn.get_field_of_view().await.unwrap();
        assert!(w > 0.0 && h > 0.0);
        assert!(conn.cancel_acquisition().await.unwrap());

        conn.close().await;
        server.stop();
    }
}
