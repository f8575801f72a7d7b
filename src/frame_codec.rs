//! Interprets the bytes the mat interface board sends.
//!
//! The current board sends binary frames: `FRAME_SIZE` raw values followed by
//! the [`VERIFICATION_SEQUENCE`]. Value `i` of a frame belongs to cell
//! `(i mod ROWS, i div ROWS)`, so consecutive bytes walk down a column of the
//! grid before moving to the next one.
//!
//! Older boards sent each frame as a single line of two-digit hexadecimal
//! values instead, interleaved with `DEBUG` lines. Those are still understood
//! through [`LegacyLine`].

use crate::grid::SensorGrid;
use crate::mat::{FRAME_BUFFER_LEN, FRAME_SIZE, ROWS, VERIFICATION_SEQUENCE, VERIFICATION_WIDTH};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while_m_n},
    character::complete::{line_ending, not_line_ending},
    combinator::{all_consuming, map, map_res, opt},
    multi::count,
    sequence::{preceded, terminated},
    Finish, IResult,
};
use std::{borrow::Cow, fmt, io, str::FromStr};

/// Everything that can go wrong while pulling a frame off the link.
#[derive(Debug)]
pub enum FrameError {
    /// No bytes arrived before the read timeout elapsed.
    Timeout,

    /// The trailer of the frame did not match [`VERIFICATION_SEQUENCE`]; the
    /// byte stream has lost alignment with the frame boundaries.
    BadTrailer {
        /// The four bytes found where the trailer should have been.
        found: [u8; VERIFICATION_WIDTH],
    },

    /// A legacy text line could not be parsed.
    Malformed(String),

    /// The underlying link failed.
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FrameError::Timeout => Cow::from("timed out waiting for mat data"),
            FrameError::BadTrailer { found } => {
                Cow::from(format!("frame trailer mismatch, found {:?}", found))
            }
            FrameError::Malformed(reason) => Cow::from(format!("malformed line: {}", reason)),
            FrameError::Io(error) => Cow::from(format!("io error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Maps the flat wire index of a sensor value to its `(row, col)` cell.
pub fn cell_of_index(i: usize) -> (usize, usize) {
    (i % ROWS, i / ROWS)
}

fn grid_from_wire(values: &[u8]) -> SensorGrid {
    let mut grid = SensorGrid::filled(0);
    for (i, v) in values.iter().take(FRAME_SIZE).enumerate() {
        grid[cell_of_index(i)] = *v;
    }
    grid
}

/// Checks that the last `VERIFICATION_WIDTH` bytes of the buffer are the
/// verification sequence.
pub fn trailer_is_valid(buffer: &[u8; FRAME_BUFFER_LEN]) -> bool {
    buffer[FRAME_SIZE..] == VERIFICATION_SEQUENCE
}

/// Decodes one complete frame buffer into a grid.
pub fn decode(buffer: &[u8; FRAME_BUFFER_LEN]) -> Result<SensorGrid, FrameError> {
    if !trailer_is_valid(buffer) {
        let mut found = [0; VERIFICATION_WIDTH];
        found.copy_from_slice(&buffer[FRAME_SIZE..]);
        return Err(FrameError::BadTrailer { found });
    }

    Ok(grid_from_wire(&buffer[..FRAME_SIZE]))
}

/// Lays a grid out exactly as the board transmits it, trailer included.
pub fn encode(grid: &SensorGrid) -> [u8; FRAME_BUFFER_LEN] {
    let mut buffer = [0; FRAME_BUFFER_LEN];
    for (i, byte) in buffer.iter_mut().take(FRAME_SIZE).enumerate() {
        *byte = grid[cell_of_index(i)];
    }
    buffer[FRAME_SIZE..].copy_from_slice(&VERIFICATION_SEQUENCE);
    buffer
}

/// One line of the legacy text protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyLine {
    /// A diagnostic message printed by the board.
    Debug(String),
    /// A complete frame.
    Frame(SensorGrid),
}

fn parse_hex_byte(s: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |h: &str| u8::from_str_radix(h, 16),
    )(s)
}

fn parse_debug_line(s: &str) -> IResult<&str, String> {
    map(preceded(tag("DEBUG"), not_line_ending), |rest: &str| {
        rest.trim().to_owned()
    })(s)
}

fn parse_frame_line(s: &str) -> IResult<&str, SensorGrid> {
    map(count(parse_hex_byte, FRAME_SIZE), |values: Vec<u8>| {
        grid_from_wire(&values)
    })(s)
}

fn parse_legacy_line(s: &str) -> IResult<&str, LegacyLine> {
    terminated(
        alt((
            map(parse_debug_line, LegacyLine::Debug),
            map(parse_frame_line, LegacyLine::Frame),
        )),
        opt(line_ending),
    )(s)
}

impl FromStr for LegacyLine {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_legacy_line)(s).finish() {
            Ok((_remaining, line)) => Ok(line),
            Err(nom::error::Error { input, code }) => Err(FrameError::Malformed(format!(
                "{:?} near {:?}",
                code,
                input.chars().take(16).collect::<String>()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat::COLS;

    fn ramp_buffer() -> [u8; FRAME_BUFFER_LEN] {
        let mut buffer = [0; FRAME_BUFFER_LEN];
        for (i, b) in buffer.iter_mut().take(FRAME_SIZE).enumerate() {
            *b = (i % 251) as u8;
        }
        buffer[FRAME_SIZE..].copy_from_slice(&VERIFICATION_SEQUENCE);
        buffer
    }

    #[test]
    fn decode_maps_wire_index_to_cell() {
        let buffer = ramp_buffer();
        let grid = decode(&buffer).unwrap();

        for r in 0..ROWS {
            for c in 0..COLS {
                assert_eq!(grid[(r, c)], buffer[c * ROWS + r]);
            }
        }
    }

    #[test]
    fn any_trailer_mutation_is_rejected() {
        for pos in FRAME_SIZE..FRAME_BUFFER_LEN {
            for delta in [1u8, 17, 128] {
                let mut buffer = ramp_buffer();
                buffer[pos] = buffer[pos].wrapping_add(delta);
                match decode(&buffer) {
                    Err(FrameError::BadTrailer { found }) => {
                        assert_eq!(found[..], buffer[FRAME_SIZE..]);
                    }
                    other => panic!("expected BadTrailer, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn encode_inverts_decode() {
        let buffer = ramp_buffer();
        let grid = decode(&buffer).unwrap();
        assert_eq!(encode(&grid)[..], buffer[..]);
    }

    #[test]
    fn legacy_frame_line() {
        let mut line: String = (0..FRAME_SIZE).map(|i| format!("{:02x}", i % 256)).collect();
        line.push_str("\r\n");

        let parsed: LegacyLine = line.parse().unwrap();
        let LegacyLine::Frame(grid) = parsed else {
            panic!("expected a frame");
        };
        assert_eq!(grid[(0, 0)], 0);
        assert_eq!(grid[(1, 0)], 1);
        assert_eq!(grid[(0, 1)], ROWS as u8);
    }

    #[test]
    fn legacy_debug_line() {
        let parsed: LegacyLine = "DEBUG adc1 ready\r\n".parse().unwrap();
        assert_eq!(parsed, LegacyLine::Debug("adc1 ready".to_owned()));
    }

    #[test]
    fn legacy_short_line_is_malformed() {
        let line = "00ff".repeat(10);
        assert!(matches!(
            line.parse::<LegacyLine>(),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn legacy_bad_digit_is_malformed() {
        let mut line: String = "0a".repeat(FRAME_SIZE);
        line.replace_range(10..12, "zz");
        assert!(line.parse::<LegacyLine>().is_err());
    }
}
