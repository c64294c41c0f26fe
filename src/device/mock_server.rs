//! In-process stand-in for the microscope control server.
//!
//! Speaks the same wire protocol as the real server so the client, the
//! acquisition session and the pipeline can be exercised without hardware.
//! Acquisitions follow scripted [`MockJob`]s, one per `acquire_` message.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::codec::{self, END_MARKER};
use crate::protocol::Command;
use crate::validation::is_in_range;

/// Stage travel limits in micrometers (X, Y, Z).
pub const STAGE_LIMITS: [(f32, f32); 3] = [(-21000.0, 33000.0), (-9000.0, 11000.0), (-1000.0, 1000.0)];

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Scripted server-side behavior of one acquisition.
///
/// Each status poll advances one step; the last status and progress entries
/// repeat once the script runs out.
#[derive(Debug, Clone)]
pub struct MockJob {
    /// Status replies, one per poll
    pub statuses: Vec<String>,
    /// Progress replies (completed, total), indexed like `statuses`
    pub progress: Vec<(i32, i32)>,
}

impl MockJob {
    /// Reports `RUNNING` with one more file per poll, then `SUCCESS:`.
    #[must_use]
    pub fn completes_after(polls: usize, total: i32) -> Self {
        let mut statuses = vec!["RUNNING".to_string(); polls];
        statuses.push("SUCCESS:".to_string());
        let progress = (0..=polls)
            .map(|i| ((i as i32 + 1).min(total), total))
            .collect();
        Self { statuses, progress }
    }

    /// Reports `RUNNING`, then `FAILED:<detail>`.
    #[must_use]
    pub fn fails_after(polls: usize, detail: &str) -> Self {
        let mut statuses = vec!["RUNNING".to_string(); polls];
        statuses.push(format!("FAILED:{detail}"));
        Self {
            statuses,
            progress: vec![(0, 0)],
        }
    }

    /// Reports `RUNNING` forever with a fixed progress count.
    #[must_use]
    pub fn stalls_at(completed: i32, total: i32) -> Self {
        Self {
            statuses: vec!["RUNNING".to_string()],
            progress: vec![(completed, total)],
        }
    }
}

#[derive(Debug)]
struct ActiveJob {
    script: MockJob,
    polls: usize,
    cancel_polls: Option<usize>,
}

#[derive(Debug)]
struct MockState {
    position: (f32, f32),
    z: f32,
    rotation: f32,
    field_of_view: (f32, f32),
    hardware_fault: Option<String>,
    silent: bool,
    move_delay: Duration,
    jobs: VecDeque<MockJob>,
    active: Option<ActiveJob>,
    acquisitions: Vec<String>,
    commands: Vec<String>,
    connections: usize,
    cancel_requests: usize,
    status_polls: usize,
    dropped_status_polls: BTreeSet<usize>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            position: (0.0, 0.0),
            z: 0.0,
            rotation: 0.0,
            field_of_view: (1392.0, 1040.0),
            hardware_fault: None,
            silent: false,
            move_delay: Duration::ZERO,
            jobs: VecDeque::new(),
            active: None,
            acquisitions: Vec::new(),
            commands: Vec::new(),
            connections: 0,
            cancel_requests: 0,
            status_polls: 0,
            dropped_status_polls: BTreeSet::new(),
        }
    }
}

impl MockState {
    fn query_reply(&self, values: &[f32]) -> Vec<u8> {
        match &self.hardware_fault {
            Some(detail) => {
                let mut reply = format!("HWERR:{detail}").into_bytes();
                let min_len = values.len() * 4;
                if reply.len() < min_len {
                    reply.resize(min_len, b' ');
                }
                reply
            }
            None => codec::encode_f32s(values),
        }
    }

    fn begin_acquisition(&mut self, message: String) {
        let script = self
            .jobs
            .pop_front()
            .unwrap_or_else(|| MockJob::completes_after(2, 4));
        info!("Mock acquisition started: {}", message);
        self.acquisitions.push(message);
        self.active = Some(ActiveJob {
            script,
            polls: 0,
            cancel_polls: None,
        });
    }

    fn next_status(&mut self) -> Vec<u8> {
        let Some(job) = self.active.as_mut() else {
            return codec::encode_status_frame("IDLE");
        };
        let text = match job.cancel_polls.as_mut() {
            Some(polls) => {
                *polls += 1;
                let word = if *polls > 1 { "CANCELLED" } else { "CANCELLING" };
                word.to_string()
            }
            None => {
                let last = job.script.statuses.len().saturating_sub(1);
                let text = job
                    .script
                    .statuses
                    .get(job.polls.min(last))
                    .cloned()
                    .unwrap_or_else(|| "IDLE".to_string());
                job.polls += 1;
                text
            }
        };
        // Sentinel replies go out as-is, state words padded to the frame.
        if codec::status_has_text(text.as_bytes()) {
            text.into_bytes()
        } else {
            codec::encode_status_frame(&text)
        }
    }

    fn current_progress(&self) -> Vec<u8> {
        let (current, total) = self
            .active
            .as_ref()
            .and_then(|job| {
                let last = job.script.progress.len().checked_sub(1)?;
                job.script
                    .progress
                    .get(job.polls.saturating_sub(1).min(last))
                    .copied()
            })
            .unwrap_or((0, 0));
        let mut reply = current.to_be_bytes().to_vec();
        reply.extend_from_slice(&total.to_be_bytes());
        reply
    }

    /// Count a status poll; true when this one should get no answer.
    fn drops_status_poll(&mut self) -> bool {
        let index = self.status_polls;
        self.status_polls += 1;
        self.dropped_status_polls.remove(&index)
    }

    fn request_cancel(&mut self) {
        self.cancel_requests += 1;
        if let Some(job) = self.active.as_mut() {
            job.cancel_polls.get_or_insert(0);
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Handle to a running mock server. Clones share the same server.
#[derive(Clone)]
pub struct MockMicroscopeServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MockMicroscopeServer {
    /// Start on an ephemeral localhost port.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_on("127.0.0.1:0").await
    }

    /// Start on the given address.
    pub async fn start_on(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        let server = Self {
            addr,
            state: Arc::new(Mutex::new(MockState::default())),
            shutdown: Arc::new(shutdown),
        };
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&server.state),
            Arc::clone(&server.shutdown),
        ));
        info!("Mock microscope server listening on {}", addr);
        Ok(server)
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Set stage X, Y and Z.
    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        let mut state = self.state.lock();
        state.position = (x, y);
        state.z = z;
    }

    /// Set the rotation axis position.
    pub fn set_rotation(&self, ticks: f32) {
        self.state.lock().rotation = ticks;
    }

    /// Set the camera field of view.
    pub fn set_field_of_view(&self, width: f32, height: f32) {
        self.state.lock().field_of_view = (width, height);
    }

    /// Answer position queries with the hardware-fault sentinel.
    pub fn set_hardware_fault(&self, detail: Option<&str>) {
        self.state.lock().hardware_fault = detail.map(str::to_string);
    }

    /// Read commands but never answer them.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Simulated stage travel time.
    pub fn set_move_delay(&self, delay: Duration) {
        self.state.lock().move_delay = delay;
    }

    /// Hang up instead of answering the given status polls, counted from zero
    /// across all connections.
    pub fn drop_status_polls(&self, polls: impl IntoIterator<Item = usize>) {
        self.state.lock().dropped_status_polls.extend(polls);
    }

    /// Queue the script for the next acquisition.
    pub fn push_job(&self, job: MockJob) {
        self.state.lock().jobs.push_back(job);
    }

    /// Acquisition messages received, end marker stripped.
    #[must_use]
    pub fn acquisitions(&self) -> Vec<String> {
        self.state.lock().acquisitions.clone()
    }

    /// Command words received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    /// Cancel requests received so far.
    #[must_use]
    pub fn cancel_requests(&self) -> usize {
        self.state.lock().cancel_requests
    }

    /// Stop accepting and drop every client socket.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the server is stopped, locally or by a `shutdown` command.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<MockState>>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Mock server accepted {}", peer);
                    state.lock().connections += 1;
                    tokio::spawn(handle_client(socket, Arc::clone(&state), Arc::clone(&shutdown)));
                }
                Err(e) => warn!("Mock server accept failed: {}", e),
            }
        }
    }
    info!("Mock microscope server stopped");
}

async fn handle_client(
    mut socket: TcpStream,
    state: Arc<Mutex<MockState>>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        let mut word = [0u8; 8];
        let read = tokio::select! {
            r = socket.read_exact(&mut word) => r,
            _ = stop.changed() => break,
        };
        if read.is_err() {
            break;
        }
        let Some(cmd) = Command::from_word(&word) else {
            warn!(
                "Mock server received unknown command {:?}",
                String::from_utf8_lossy(&word)
            );
            break;
        };
        state.lock().commands.push(cmd.to_string());

        match respond(&mut socket, cmd, &state, &shutdown).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                debug!("Mock client connection ended: {}", e);
                break;
            }
        }
    }
}

async fn respond(
    socket: &mut TcpStream,
    cmd: Command,
    state: &Mutex<MockState>,
    shutdown: &watch::Sender<bool>,
) -> std::io::Result<Flow> {
    if state.lock().silent {
        return Ok(Flow::Continue);
    }

    let reply = match cmd {
        Command::GetStageXY => {
            let s = state.lock();
            s.query_reply(&[s.position.0, s.position.1])
        }
        Command::GetStageZ => {
            let s = state.lock();
            s.query_reply(&[s.z])
        }
        Command::GetRotation => {
            let s = state.lock();
            s.query_reply(&[s.rotation])
        }
        Command::GetFieldOfView => {
            let s = state.lock();
            codec::encode_f32s(&[s.field_of_view.0, s.field_of_view.1])
        }
        Command::MoveStageXY => {
            let values = read_floats(socket, 2).await?;
            move_axes(state, &[(0, values[0]), (1, values[1])]).await;
            return Ok(Flow::Continue);
        }
        Command::MoveStageZ => {
            let values = read_floats(socket, 1).await?;
            move_axes(state, &[(2, values[0])]).await;
            return Ok(Flow::Continue);
        }
        Command::MoveRotation => {
            let values = read_floats(socket, 1).await?;
            state.lock().rotation = values[0];
            return Ok(Flow::Continue);
        }
        Command::Acquire => {
            let message = read_until_marker(socket).await?;
            state.lock().begin_acquisition(message);
            return Ok(Flow::Continue);
        }
        Command::Status => {
            let mut s = state.lock();
            if s.drops_status_poll() {
                debug!("Mock server hanging up on status poll");
                return Ok(Flow::Close);
            }
            s.next_status()
        }
        Command::Progress => state.lock().current_progress(),
        Command::Cancel => {
            state.lock().request_cancel();
            codec::ACK.to_vec()
        }
        Command::Disconnect => return Ok(Flow::Close),
        Command::Shutdown => {
            info!("Mock server received shutdown");
            shutdown.send_replace(true);
            return Ok(Flow::Close);
        }
    };

    socket.write_all(&reply).await?;
    socket.flush().await?;
    Ok(Flow::Continue)
}

async fn read_floats(socket: &mut TcpStream, count: usize) -> std::io::Result<Vec<f32>> {
    let mut buf = vec![0u8; count * 4];
    socket.read_exact(&mut buf).await?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| codec::decode_f32([c[0], c[1], c[2], c[3]]))
        .collect())
}

async fn move_axes(state: &Mutex<MockState>, moves: &[(usize, f32)]) {
    for (axis, value) in moves {
        let (min, max) = STAGE_LIMITS[*axis];
        if let Err(e) = is_in_range(*value, min..=max) {
            warn!("Mock stage move rejected on axis {}: {} ({})", axis, e, value);
            return;
        }
    }
    let delay = state.lock().move_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let mut s = state.lock();
    for (axis, value) in moves {
        match axis {
            0 => s.position.0 = *value,
            1 => s.position.1 = *value,
            _ => s.z = *value,
        }
    }
}

async fn read_until_marker(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(pos) = text.find(END_MARKER) {
            return Ok(text[..pos].trim().to_string());
        }
        if buf.len() > MAX_MESSAGE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "acquisition message has no end marker",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_after_script() {
        let job = MockJob::completes_after(3, 6);
        assert_eq!(job.statuses.len(), 4);
        assert_eq!(job.statuses.last().unwrap(), "SUCCESS:");
        assert_eq!(job.progress, vec![(1, 6), (2, 6), (3, 6), (4, 6)]);
    }

    #[test]
    fn test_status_sequence_and_cancel() {
        let mut state = MockState::default();
        assert_eq!(
            codec::decode_status(&state.next_status()),
            codec::StatusReply::State("IDLE".into())
        );

        state.push_and_begin(MockJob::stalls_at(2, 10));
        assert_eq!(
            codec::decode_status(&state.next_status()),
            codec::StatusReply::State("RUNNING".into())
        );
        state.request_cancel();
        assert_eq!(
            codec::decode_status(&state.next_status()),
            codec::StatusReply::State("CANCELLING".into())
        );
        assert_eq!(
            codec::decode_status(&state.next_status()),
            codec::StatusReply::State("CANCELLED".into())
        );
        assert_eq!(state.cancel_requests, 1);
    }

    #[test]
    fn test_sentinel_status_is_not_padded() {
        let mut state = MockState::default();
        state.push_and_begin(MockJob::completes_after(0, 1));
        assert_eq!(state.next_status(), b"SUCCESS:".to_vec());

        state.push_and_begin(MockJob::fails_after(0, "timeout"));
        assert_eq!(state.next_status(), b"FAILED:timeout".to_vec());
    }

    #[test]
    fn test_dropped_status_polls_are_counted_across_calls() {
        let mut state = MockState::default();
        state.dropped_status_polls.extend([1]);
        assert!(!state.drops_status_poll());
        assert!(state.drops_status_poll());
        assert!(!state.drops_status_poll());
    }

    #[test]
    fn test_fault_reply_is_padded() {
        let state = MockState {
            hardware_fault: Some("x".into()),
            ..Default::default()
        };
        let reply = state.query_reply(&[1.0, 2.0]);
        assert!(reply.len() >= 8);
        assert!(codec::is_hardware_fault(&reply));
    }

    impl MockState {
        fn push_and_begin(&mut self, job: MockJob) {
            self.jobs.push_back(job);
            self.begin_acquisition("--region test".into());
        }
    }
}
