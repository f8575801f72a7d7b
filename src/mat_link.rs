//! The byte-stream seam between the pipeline and the mat interface board.
//!
//! Everything above this module talks to a [`MatLink`], so the real serial
//! port, the simulated mat in [`crate::dummy_mat`], and scripted links in tests
//! are interchangeable.

use crate::mat::Command;

use log::debug;
use serial2::SerialPort;
use std::{io, time::Duration};

/// A duplex byte stream with a bounded read timeout.
pub trait MatLink: Send {
    /// Reads up to `buf.len()` bytes. A read that times out returns either
    /// `Ok(0)` or an error of kind [`io::ErrorKind::TimedOut`].
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer to the link.
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Drops every byte received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Sends a newline-terminated command to the board.
    fn send_command(&mut self, command: Command) -> io::Result<()> {
        debug!("Sending command {}", command);
        self.write_bytes(&command.to_line())
    }
}

impl MatLink for SerialPort {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        SerialPort::write_all(self, buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        SerialPort::discard_input_buffer(self)
    }
}

impl<L: MatLink + ?Sized> MatLink for Box<L> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_bytes(buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_bytes(buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

impl<L: MatLink + ?Sized> MatLink for &mut L {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_bytes(buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_bytes(buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

/// Enumerates and opens links. Sessions and samplers go through this so a
/// missing port can be detected before anything is opened.
pub trait PortOpener: Send + Sync {
    /// The link type produced by [`PortOpener::open`].
    type Link: MatLink + 'static;

    /// Names of the ports currently present.
    fn available_ports(&self) -> io::Result<Vec<String>>;

    /// Opens `port` at `baud` with the given read timeout.
    fn open(&self, port: &str, baud: u32, timeout: Duration) -> io::Result<Self::Link>;
}

/// Opens real serial ports through `serial2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    type Link = SerialPort;

    fn available_ports(&self) -> io::Result<Vec<String>> {
        Ok(SerialPort::available_ports()?
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }

    fn open(&self, port: &str, baud: u32, timeout: Duration) -> io::Result<SerialPort> {
        let mut serial = SerialPort::open(port, baud)?;
        serial.set_read_timeout(timeout)?;
        Ok(serial)
    }
}

/// Whether an I/O error means "nothing arrived in time" rather than a failure.
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
pub(crate) mod testing {
    //! A link that replays a fixed byte script, for exercising readers.

    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    /// Replays `chunks` one read at a time. An empty chunk reads as a
    /// timeout. Once the script runs out every read times out.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedLink {
        pub chunks: VecDeque<Vec<u8>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub discards: Arc<Mutex<usize>>,
    }

    impl ScriptedLink {
        pub fn new(bytes: Vec<u8>) -> Self {
            ScriptedLink {
                chunks: VecDeque::from(vec![bytes]),
                ..Default::default()
            }
        }

        pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
            ScriptedLink {
                chunks: chunks.into(),
                ..Default::default()
            }
        }
    }

    impl MatLink for ScriptedLink {
        fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.chunks.front_mut() else {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"));
            };
            if chunk.is_empty() {
                self.chunks.pop_front();
                return Ok(0);
            }
            let n = buf.len().min(chunk.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
            Ok(n)
        }

        fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn discard_input(&mut self) -> io::Result<()> {
            // the script models bytes still in flight, so nothing is pending
            *self.discards.lock().unwrap() += 1;
            Ok(())
        }
    }
}
