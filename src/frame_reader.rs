//! Pulls validated frames off a [`MatLink`].
//!
//! When the board fills the host's receive buffer faster than it is drained,
//! bytes get dropped and the stream slides out of alignment with the frame
//! boundaries. The reader notices this through a bad trailer, throws away
//! whatever is pending, and then walks the stream one byte at a time until the
//! last four bytes seen are the verification sequence. The next byte starts a
//! fresh frame.

use crate::frame_codec::{decode, FrameError};
use crate::grid::SensorGrid;
use crate::mat::{Command, FRAME_BUFFER_LEN, VERIFICATION_SEQUENCE, VERIFICATION_WIDTH};
use crate::mat_link::{is_timeout, MatLink};

use log::{debug, warn};
use std::io;

/// How many resynchronisations may happen back to back, without a single
/// good frame in between, before the reader gives up and reports the bad
/// trailer to its caller.
pub const DEFAULT_MAX_CONSECUTIVE_RESYNCS: u32 = 8;

enum Fill {
    Full,
    Partial(usize),
    Nothing,
}

/// A restartable reader of frames. Every call to [`FrameReader::next_frame`]
/// either produces a frame or a typed error, and leaves the reader usable for
/// the next call.
pub struct FrameReader<L: MatLink> {
    link: L,
    buffer: Box<[u8; FRAME_BUFFER_LEN]>,
    window: [u8; VERIFICATION_WIDTH],
    aligned: bool,
    transmission_errors: u64,
    consecutive_resyncs: u32,
    max_consecutive_resyncs: u32,
}

impl<L: MatLink> FrameReader<L> {
    /// Wraps a link that is assumed to sit on a frame boundary.
    pub fn new(link: L) -> Self {
        FrameReader {
            link,
            buffer: Box::new([0; FRAME_BUFFER_LEN]),
            window: [0; VERIFICATION_WIDTH],
            aligned: true,
            transmission_errors: 0,
            consecutive_resyncs: 0,
            max_consecutive_resyncs: DEFAULT_MAX_CONSECUTIVE_RESYNCS,
        }
    }

    /// Sets how many back-to-back resynchronisations are tolerated.
    pub fn with_resync_cap(self, max_consecutive_resyncs: u32) -> Self {
        FrameReader {
            max_consecutive_resyncs,
            ..self
        }
    }

    /// Number of resynchronisation events since the reader was created.
    pub fn transmission_errors(&self) -> u64 {
        self.transmission_errors
    }

    /// Whether the reader currently trusts its frame alignment.
    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Sends a command to the board through the wrapped link.
    pub fn send_command(&mut self, command: Command) -> Result<(), FrameError> {
        self.link.send_command(command).map_err(FrameError::Io)
    }

    /// Gives the link back.
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Reads the next valid frame, resynchronising as needed.
    pub fn next_frame(&mut self) -> Result<SensorGrid, FrameError> {
        loop {
            if !self.aligned {
                self.scan_for_trailer()?;
            }

            match self.fill_buffer()? {
                Fill::Nothing => return Err(FrameError::Timeout),
                Fill::Partial(n) => {
                    warn!("Frame cut short after {} bytes, resynchronising", n);
                    let mut found = [0; VERIFICATION_WIDTH];
                    if n >= VERIFICATION_WIDTH {
                        found.copy_from_slice(&self.buffer[n - VERIFICATION_WIDTH..n]);
                    }
                    self.begin_resync(found)?;
                }
                Fill::Full => match decode(&self.buffer) {
                    Ok(grid) => {
                        self.consecutive_resyncs = 0;
                        return Ok(grid);
                    }
                    Err(FrameError::BadTrailer { found }) => {
                        warn!("Transmission error, trailer was {:?}; resynchronising", found);
                        self.begin_resync(found)?;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Reads one frame's worth of bytes into the buffer.
    fn fill_buffer(&mut self) -> Result<Fill, FrameError> {
        let mut filled = 0;
        while filled < FRAME_BUFFER_LEN {
            match self.link.read_bytes(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(FrameError::Io(e)),
            }
        }

        Ok(match filled {
            0 => Fill::Nothing,
            FRAME_BUFFER_LEN => Fill::Full,
            n => Fill::Partial(n),
        })
    }

    /// Records one resynchronisation event and drops the link's pending
    /// input. Fails with the offending trailer once the cap is exceeded.
    fn begin_resync(&mut self, found: [u8; VERIFICATION_WIDTH]) -> Result<(), FrameError> {
        self.transmission_errors += 1;
        self.consecutive_resyncs += 1;
        self.aligned = false;
        self.window = [0; VERIFICATION_WIDTH];
        self.link.discard_input().map_err(FrameError::Io)?;

        if self.consecutive_resyncs > self.max_consecutive_resyncs {
            self.consecutive_resyncs = 0;
            return Err(FrameError::BadTrailer { found });
        }
        Ok(())
    }

    /// Slides a window over the stream until it holds the verification
    /// sequence. A timeout leaves the scan where it was so the next call
    /// picks it up again.
    fn scan_for_trailer(&mut self) -> Result<(), FrameError> {
        let mut byte = [0u8; 1];
        let mut scanned = 0usize;
        while self.window != VERIFICATION_SEQUENCE {
            match self.link.read_bytes(&mut byte) {
                Ok(0) => return Err(FrameError::Timeout),
                Ok(_) => {
                    self.window.rotate_left(1);
                    self.window[VERIFICATION_WIDTH - 1] = byte[0];
                    scanned += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(FrameError::Timeout),
                Err(e) => return Err(FrameError::Io(e)),
            }
        }

        debug!("Realigned after scanning {} bytes", scanned);
        self.aligned = true;
        self.window = [0; VERIFICATION_WIDTH];
        Ok(())
    }
}

impl<L: MatLink> Iterator for FrameReader<L> {
    type Item = Result<SensorGrid, FrameError>;

    /// Never ends; a reader is exhausted only when its caller stops asking.
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_frame())
    }
}
