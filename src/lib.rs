//! Matterface is the host-side software for a 28 by 56 resistive pressure
//! mat. The mat's interface board streams raw frames of 8-bit cell readings
//! over a serial link. This crate reads those frames, recovers from a stream
//! that has drifted out of alignment, and turns raw readings into pressure
//! using a calibration curve fitted independently for every cell.
//!
//! The pieces, from the wire up:
//!
//! - [`frame_codec`] and [`frame_reader`] decode frames off a [`mat_link`],
//!   resynchronising when a frame's trailer is wrong.
//! - [`calibration`] fits, applies, zeroes and persists per-cell curves,
//!   using the solvers in [`curve_fit`].
//! - [`session`] runs continuous acquisition on its own thread, writing each
//!   calibrated frame to disk as an `.npy` file and publishing events.
//! - [`sampler`] takes one-shot readings for calibration and zeroing.
//! - [`dummy_mat`] simulates the board, so everything above can run without
//!   hardware.
//!
//! The `matterface` binary drives a real mat from the command line, and the
//! `monitor` binary shows a session against the simulated one.

#![warn(missing_docs)]
pub mod args;
pub mod calibration;
pub mod config;
pub mod curve_fit;
pub mod dummy_mat;
pub mod frame_codec;
pub mod frame_reader;
pub mod grid;
pub mod mat;
pub mod mat_link;
pub mod sampler;
pub mod session;
pub mod session_stats;
pub mod tui;
