//! A simulated mat interface board, for running the pipeline without
//! hardware.
//!
//! The simulated board behaves like the firmware: it idles until it receives a
//! command, answers `get_cal_vals` with a single frame, and after
//! `start_reading` streams frames at a fixed rate. Frames are generated on a
//! background thread from a [`Load`] plus uniform noise, and can be preceded
//! by junk bytes to exercise resynchronisation.

use crate::frame_codec::encode;
use crate::grid::SensorGrid;
use crate::mat::Command;
use crate::mat_link::{MatLink, PortOpener};

use log::{debug, warn};
use rand::prelude::*;
use std::{
    collections::VecDeque,
    io,
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

/// Name under which [`DummyOpener`] lists the simulated board.
pub const DUMMY_PORT: &str = "dummy";

/// Byte used to pad injected junk.
const JUNK_BYTE: u8 = 0x55;

/// What is resting on the simulated mat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Load {
    /// Every cell reads `raw`.
    Uniform(u8),
    /// A round footprint whose reading falls off linearly from `peak` at
    /// its centre to nothing at `radius` cells out.
    Footprint {
        row: f64,
        col: f64,
        radius: f64,
        peak: u8,
    },
}

impl Load {
    fn raw_at(&self, r: usize, c: usize) -> u8 {
        match *self {
            Load::Uniform(raw) => raw,
            Load::Footprint {
                row,
                col,
                radius,
                peak,
            } => {
                let d = ((r as f64 - row).powi(2) + (c as f64 - col).powi(2)).sqrt();
                if radius <= 0.0 || d >= radius {
                    0
                } else {
                    (f64::from(peak) * (1.0 - d / radius)).round() as u8
                }
            }
        }
    }
}

/// How a [`DummyMat`] starts out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DummyConfig {
    /// Frames per second while streaming.
    pub rate_hz: f64,
    /// Each cell gets up to this much added at random.
    pub noise: u8,
    pub load: Load,
    /// How long a read waits for bytes before timing out.
    pub timeout: Duration,
}

impl Default for DummyConfig {
    fn default() -> Self {
        DummyConfig {
            rate_hz: 20.0,
            noise: 2,
            load: Load::Uniform(0),
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
enum Signal {
    Command(Command),
    Load(Load),
    Noise(u8),
    Rate(f64),
    Corrupt(usize),
    Stop,
}

/// Bytes the board has sent but the host has not read yet.
#[derive(Debug, Default)]
struct Outbox {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Outbox {
    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        match self.bytes.lock() {
            Ok(bytes) => bytes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, junk: usize, frame: &SensorGrid) {
        let mut bytes = self.lock();
        bytes.extend(std::iter::repeat(JUNK_BYTE).take(junk));
        bytes.extend(encode(frame));
        self.ready.notify_all();
    }
}

/// Changes the behaviour of a running [`DummyMat`] from any thread.
#[derive(Debug, Clone)]
pub struct DummyController {
    tx: mpsc::Sender<Signal>,
}

impl DummyController {
    fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            warn!("Simulated mat has already stopped");
        }
    }

    pub fn set_load(&self, load: Load) {
        self.send(Signal::Load(load));
    }

    pub fn set_noise(&self, noise: u8) {
        self.send(Signal::Noise(noise));
    }

    pub fn set_rate(&self, rate_hz: f64) {
        self.send(Signal::Rate(rate_hz));
    }

    /// Sends `junk` stray bytes ahead of the next frame, knocking the
    /// stream out of alignment.
    pub fn inject_corruption(&self, junk: usize) {
        self.send(Signal::Corrupt(junk));
    }
}

/// State owned by the board thread.
struct Board {
    load: Load,
    noise: u8,
    period: Duration,
    streaming: bool,
    junk: usize,
    running: bool,
}

impl Board {
    fn new(config: &DummyConfig) -> Self {
        Board {
            load: config.load,
            noise: config.noise,
            period: period_of(config.rate_hz),
            streaming: false,
            junk: 0,
            running: true,
        }
    }

    fn handle(&mut self, signal: Signal, outbox: &Outbox, rng: &mut impl Rng) {
        debug!("Simulated mat received {:?}", signal);
        match signal {
            Signal::Command(Command::StartReading) => self.streaming = true,
            Signal::Command(Command::GetCalVals) => self.emit(outbox, rng),
            Signal::Command(Command::PrintInfo) => {}
            Signal::Load(load) => self.load = load,
            Signal::Noise(noise) => self.noise = noise,
            Signal::Rate(rate_hz) => self.period = period_of(rate_hz),
            Signal::Corrupt(junk) => self.junk += junk,
            Signal::Stop => self.running = false,
        }
    }

    fn emit(&mut self, outbox: &Outbox, rng: &mut impl Rng) {
        let frame = generate_frame(&self.load, self.noise, rng);
        outbox.push(std::mem::take(&mut self.junk), &frame);
    }
}

fn period_of(rate_hz: f64) -> Duration {
    if rate_hz > 0.0 {
        Duration::from_secs_f64(1.0 / rate_hz)
    } else {
        Duration::from_secs(1)
    }
}

fn generate_frame(load: &Load, noise: u8, rng: &mut impl Rng) -> SensorGrid {
    SensorGrid::from_fn(|r, c| {
        let jitter = if noise > 0 { rng.gen_range(0..=noise) } else { 0 };
        load.raw_at(r, c).saturating_add(jitter)
    })
}

fn run_board(config: DummyConfig, rx: mpsc::Receiver<Signal>, outbox: Arc<Outbox>) {
    let mut rng = thread_rng();
    let mut board = Board::new(&config);

    while board.running {
        if !board.streaming {
            // idle in the command loop until told otherwise
            match rx.recv() {
                Ok(signal) => board.handle(signal, &outbox, &mut rng),
                Err(_) => break,
            }
            continue;
        }

        let next_due = Instant::now() + board.period;
        loop {
            match rx.try_recv() {
                Ok(signal) => board.handle(signal, &outbox, &mut rng),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    board.running = false;
                    break;
                }
            }
        }
        if !board.running {
            break;
        }

        board.emit(&outbox, &mut rng);
        let now = Instant::now();
        if next_due > now {
            spin_sleep::sleep(next_due - now);
        }
    }
}

/// The simulated board, seen from the host side of the link.
pub struct DummyMat {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    outbox: Arc<Outbox>,
    timeout: Duration,
    line: Vec<u8>,
}

impl DummyMat {
    /// Powers up a simulated board.
    pub fn new(config: DummyConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();
        let outbox = Arc::new(Outbox::default());
        let th_outbox = Arc::clone(&outbox);
        let handle = thread::spawn(move || run_board(config, rx, th_outbox));

        DummyMat {
            handle: Some(handle),
            tx,
            outbox,
            timeout: config.timeout,
            line: Vec::new(),
        }
    }

    pub fn controller(&self) -> DummyController {
        DummyController {
            tx: self.tx.clone(),
        }
    }

    /// Powers the board down and waits for its thread.
    pub fn stop(&mut self) {
        // a board that is already gone has nothing to stop
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("Simulated mat thread panicked");
            }
        }
    }

    fn accept_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line).trim().to_owned();
        self.line.clear();
        let command = match line.as_str() {
            "start_reading" => Command::StartReading,
            "get_cal_vals" => Command::GetCalVals,
            "print_info" => Command::PrintInfo,
            "" => return,
            other => {
                warn!("Simulated mat ignoring unknown command {:?}", other);
                return;
            }
        };
        let _ = self.tx.send(Signal::Command(command));
    }
}

impl MatLink for DummyMat {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut bytes = self.outbox.lock();
        while bytes.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from mat"));
            }
            bytes = match self.outbox.ready.wait_timeout(bytes, deadline - now) {
                Ok((bytes, _)) => bytes,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let n = buf.len().min(bytes.len());
        for (dst, src) in buf.iter_mut().zip(bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        for &b in buf {
            if b == b'\n' {
                self.accept_line();
            } else {
                self.line.push(b);
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.outbox.lock().clear();
        Ok(())
    }
}

impl Drop for DummyMat {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lists and opens simulated boards, so a session can run against one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyOpener {
    pub config: DummyConfig,
}

impl PortOpener for DummyOpener {
    type Link = DummyMat;

    fn available_ports(&self) -> io::Result<Vec<String>> {
        Ok(vec![DUMMY_PORT.to_owned()])
    }

    fn open(&self, port: &str, _baud: u32, timeout: Duration) -> io::Result<DummyMat> {
        if port != DUMMY_PORT {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated mat at {}", port),
            ));
        }
        Ok(DummyMat::new(DummyConfig {
            timeout,
            ..self.config
        }))
    }
}
