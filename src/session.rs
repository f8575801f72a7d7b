//! Continuous acquisition: the loop that turns a stream of frames from the
//! mat into calibrated, persisted, published frames.
//!
//! A session moves through [`SessionState::Idle`], `Connecting`, `Polling`
//! and finally `Stopped`. It runs on its own thread once started, and
//! everything it produces is published on its [`EventBus`]. Stopping is
//! cooperative: the handle clears a flag that the loop checks between reads,
//! so a stop takes effect within one read timeout.

use crate::calibration::{read_model, SharedCalibration};
use crate::frame_codec::FrameError;
use crate::frame_reader::{FrameReader, DEFAULT_MAX_CONSECUTIVE_RESYNCS};
use crate::grid::{CalibratedGrid, SensorGrid};
use crate::mat::Command;
use crate::mat_link::{MatLink, PortOpener, SerialOpener};
use crate::session_stats::{SessionStats, StatsSnapshot};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use ndarray_npy::{write_npy, WriteNpyError};
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// Everything a session needs to know before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Name of the serial port the mat is attached to.
    pub port: String,
    pub baud: u32,
    /// Read timeout of the link. Also bounds how long a stop takes.
    pub timeout: Duration,
    /// Weight resting on the mat during the session, if known.
    pub expected_weight_lbs: Option<f64>,
    /// Session directories are created under this. `None` disables
    /// persistence.
    pub output_root: Option<PathBuf>,
    /// Resynchronisations tolerated back to back before the session fails.
    pub max_consecutive_resyncs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port: "/dev/ttyACM0".to_owned(),
            baud: 115200,
            timeout: Duration::from_secs(1),
            expected_weight_lbs: None,
            output_root: Some(PathBuf::from("recordings")),
            max_consecutive_resyncs: DEFAULT_MAX_CONSECUTIVE_RESYNCS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Polling,
    Stopped,
}

/// The link to the mat could not be established.
#[derive(Debug)]
pub enum ConnectionError {
    /// The configured port is not among the ports present.
    PortNotFound(String),

    /// Enumerating or opening the port failed.
    Io(io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConnectionError::PortNotFound(port) => Cow::from(format!("port {} not found", port)),
            ConnectionError::Io(e) => Cow::from(format!("io error: {}", e)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Why a session ended other than by request.
#[derive(Debug)]
pub enum SessionError {
    Connection(ConnectionError),

    /// The frame stream failed beyond recovery.
    Frame(FrameError),

    /// The session directory could not be created.
    Output(io::Error),

    /// The session thread panicked.
    Panicked,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SessionError::Connection(e) => Cow::from(format!("connection failed: {}", e)),
            SessionError::Frame(e) => Cow::from(format!("frame stream failed: {}", e)),
            SessionError::Output(e) => {
                Cow::from(format!("could not create session directory: {}", e))
            }
            SessionError::Panicked => Cow::from("session thread panicked"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SessionError {}

impl From<ConnectionError> for SessionError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

impl From<FrameError> for SessionError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

/// How a session came to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Someone asked it to.
    Requested,
    /// The configured port was not present.
    PortNotFound(String),
    /// The frame stream could not be recovered.
    StreamFailed(String),
    /// Any other failure.
    Failed(String),
}

impl From<&SessionError> for StopReason {
    fn from(value: &SessionError) -> Self {
        match value {
            SessionError::Connection(ConnectionError::PortNotFound(port)) => {
                StopReason::PortNotFound(port.clone())
            }
            SessionError::Frame(e) => StopReason::StreamFailed(e.to_string()),
            other => StopReason::Failed(other.to_string()),
        }
    }
}

/// What a session tells its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),

    /// The session is writing its frames into `dir`.
    Recording { dir: PathBuf },

    /// Frame number `index` was calibrated.
    FrameReady {
        index: u64,
        grid: Arc<CalibratedGrid>,
    },

    /// Frame number `index` could not be written to disk. The session keeps
    /// going.
    PersistenceFailed { index: u64, reason: String },

    /// Sent after every frame.
    LiveStats(StatsSnapshot),

    /// Sent once polling ends.
    FinalStats(StatsSnapshot),

    /// Always the last event of a session.
    Stopped { reason: StopReason },
}

/// Fans events out to any number of subscribers. Each subscriber receives
/// every event published after it subscribed, in publication order.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Delivers `event` to every subscriber, forgetting the ones that hung up.
    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Creates `<root>/<yy_mm_dd_THH_MM_SS>_<n>`, picking the lowest `n` not
/// already taken.
pub fn create_output_dir(root: &Path, started: DateTime<Local>) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let stamp = started.format("%y_%m_%d_T%H_%M_%S").to_string();
    let mut n = 0usize;
    loop {
        let dir = root.join(format!("{}_{}", stamp, n));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Path of frame number `index` inside a session directory.
pub fn frame_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{:05}.npy", index))
}

fn save_frame(path: &Path, grid: &CalibratedGrid) -> Result<(), WriteNpyError> {
    write_npy(path, &grid.to_array())
}

/// A continuous acquisition from one mat.
pub struct AcquisitionSession<O: PortOpener = SerialOpener> {
    config: SessionConfig,
    calibration: SharedCalibration,
    opener: O,
    events: Arc<EventBus>,
    polling: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
}

impl AcquisitionSession<SerialOpener> {
    /// A session reading from a real serial port.
    pub fn new(config: SessionConfig, calibration: SharedCalibration) -> Self {
        AcquisitionSession::with_opener(config, calibration, SerialOpener)
    }
}

impl<O: PortOpener + 'static> AcquisitionSession<O> {
    /// A session that opens its link through `opener`.
    pub fn with_opener(config: SessionConfig, calibration: SharedCalibration, opener: O) -> Self {
        AcquisitionSession {
            config,
            calibration,
            opener,
            events: Arc::new(EventBus::new()),
            polling: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(SessionState::Idle)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        current_state(&self.state)
    }

    /// Asks a running session to wind down after its current read.
    pub fn request_stop(&self) {
        self.polling.store(false, Ordering::SeqCst);
    }

    /// Starts the session on its own thread, opening the configured port.
    pub fn start(self) -> SessionHandle {
        let handle_parts = (self.polling.clone(), self.state.clone());
        let thread = thread::spawn(move || self.connect_and_run());
        SessionHandle::new(handle_parts, thread)
    }

    /// Starts the session on its own thread over an already open link.
    pub fn start_with_link<L: MatLink + 'static>(self, link: L) -> SessionHandle {
        let handle_parts = (self.polling.clone(), self.state.clone());
        let thread = thread::spawn(move || self.run_with_link(link));
        SessionHandle::new(handle_parts, thread)
    }

    fn connect_and_run(&self) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        match self.connect() {
            Ok(link) => self.run_connected(link),
            Err(e) => {
                error!("Could not connect to the mat: {}", e);
                self.finish(Err(e.into()))
            }
        }
    }

    fn connect(&self) -> Result<O::Link, ConnectionError> {
        let ports = self.opener.available_ports()?;
        if !ports.iter().any(|p| p == &self.config.port) {
            debug!("Ports present: {:?}", ports);
            return Err(ConnectionError::PortNotFound(self.config.port.clone()));
        }

        info!("Opening {} at {} baud", self.config.port, self.config.baud);
        Ok(self
            .opener
            .open(&self.config.port, self.config.baud, self.config.timeout)?)
    }

    /// Runs the whole session over `link` on the calling thread, returning
    /// once it stops.
    pub fn run_with_link<L: MatLink>(&self, link: L) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        self.run_connected(link)
    }

    fn run_connected<L: MatLink>(&self, link: L) -> Result<(), SessionError> {
        let output = match &self.config.output_root {
            Some(root) => match create_output_dir(root, Local::now()) {
                Ok(dir) => Some(dir),
                Err(e) => return self.finish(Err(SessionError::Output(e))),
            },
            None => None,
        };

        let result = self.poll(link, output.as_deref());
        self.finish(result)
    }

    /// The polling loop proper. Publishes `FinalStats` on the way out.
    fn poll<L: MatLink>(&self, link: L, output: Option<&Path>) -> Result<(), SessionError> {
        let mut reader =
            FrameReader::new(link).with_resync_cap(self.config.max_consecutive_resyncs);
        reader.send_command(Command::StartReading)?;

        if let Some(dir) = output {
            info!("Recording to {}", dir.display());
            self.events.publish(SessionEvent::Recording {
                dir: dir.to_path_buf(),
            });
        }
        self.set_state(SessionState::Polling);

        let mut stats = SessionStats::new(Instant::now());
        let mut result = Ok(());
        while self.polling.load(Ordering::SeqCst) {
            let next = reader.next_frame();
            stats.set_transmission_errors(reader.transmission_errors());
            match next {
                Ok(raw) => self.handle_frame(raw, output, &mut stats),
                Err(FrameError::Timeout) => debug!("No frame before the read timeout"),
                Err(e) => {
                    error!("Stopping session: {}", e);
                    result = Err(e.into());
                    break;
                }
            }
        }

        let summary = stats.snapshot(Instant::now());
        info!("{}", summary.final_message());
        self.events.publish(SessionEvent::FinalStats(summary));
        result
    }

    fn handle_frame(&self, raw: SensorGrid, output: Option<&Path>, stats: &mut SessionStats) {
        let index = stats.frames();
        let calibrated = read_model(&self.calibration).calibrate_frame(&raw);

        if let Some(dir) = output {
            let path = frame_path(dir, index);
            if let Err(e) = save_frame(&path, &calibrated) {
                warn!("Could not save frame {} to {}: {}", index, path.display(), e);
                stats.record_persistence_error();
                self.events.publish(SessionEvent::PersistenceFailed {
                    index,
                    reason: e.to_string(),
                });
            }
        }

        self.events.publish(SessionEvent::FrameReady {
            index,
            grid: Arc::new(calibrated),
        });

        stats.record_frame(Instant::now());
        let snapshot = stats.snapshot(Instant::now());
        debug!("{}", snapshot.live_message());
        self.events.publish(SessionEvent::LiveStats(snapshot));
    }

    /// Moves to `Stopped` and tells subscribers why.
    fn finish(&self, result: Result<(), SessionError>) -> Result<(), SessionError> {
        self.polling.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Stopped);

        let reason = match &result {
            Ok(()) => StopReason::Requested,
            Err(e) => StopReason::from(e),
        };
        self.events.publish(SessionEvent::Stopped { reason });
        result
    }

    fn set_state(&self, state: SessionState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
        debug!("Session is now {:?}", state);
        self.events.publish(SessionEvent::StateChanged(state));
    }
}

fn current_state(state: &Mutex<SessionState>) -> SessionState {
    match state.lock() {
        Ok(s) => *s,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Controls a session running on its own thread. Dropping the handle stops
/// the session and waits for it.
pub struct SessionHandle {
    polling: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    thread: Option<thread::JoinHandle<Result<(), SessionError>>>,
}

impl SessionHandle {
    fn new(
        (polling, state): (Arc<AtomicBool>, Arc<Mutex<SessionState>>),
        thread: thread::JoinHandle<Result<(), SessionError>>,
    ) -> Self {
        SessionHandle {
            polling,
            state,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> SessionState {
        current_state(&self.state)
    }

    /// Whether the session thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stops the session and waits for its thread. Returns the error the
    /// session failed with, if it failed before being stopped.
    pub fn stop(mut self) -> Result<(), SessionError> {
        self.polling.store(false, Ordering::SeqCst);
        self.join()
    }

    /// Waits for the session to end on its own.
    pub fn wait(mut self) -> Result<(), SessionError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), SessionError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(Err(SessionError::Panicked)),
            None => Ok(()),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.polling.store(false, Ordering::SeqCst);
        if let Err(e) = self.join() {
            warn!("Session ended with an error: {}", e);
        }
    }
}
