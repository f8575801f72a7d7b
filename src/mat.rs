//! Physical characteristics of the pressure mat and the command set its
//! interface board understands.
//!
//! The board transmits one frame per mat read: `FRAME_SIZE` raw sensor values
//! followed by the `VERIFICATION_WIDTH`-byte [`VERIFICATION_SEQUENCE`]. The
//! dimensions below are deployment constants; a mat with a different sensor
//! layout only needs these values changed.

use std::fmt;

/// Number of sensor rows on the mat.
pub const ROWS: usize = 28;

/// Number of sensor columns on the mat.
pub const COLS: usize = 56;

/// Number of sensor cells in one frame.
pub const FRAME_SIZE: usize = ROWS * COLS;

/// Width of the trailer that closes every frame.
pub const VERIFICATION_WIDTH: usize = 4;

/// The trailer the board appends to every transmitted frame.
pub const VERIFICATION_SEQUENCE: [u8; VERIFICATION_WIDTH] = [255, 254, 254, 255];

/// Length of one complete frame buffer as it arrives over the wire.
pub const FRAME_BUFFER_LEN: usize = FRAME_SIZE + VERIFICATION_WIDTH;

/// Area of a single sensor, in square meters (0.25cm^2).
pub const SENSOR_AREA_SQM: f64 = 0.000025;

/// Area of the whole mat, in square meters.
pub const MAT_AREA_SQM: f64 = 0.1568;

/// Default upper bound on the pressure any single sensor is rated for, in
/// pascals.
pub const DEFAULT_MAX_RATED_PRESSURE_PA: f64 = 600.0;

/// Newtons per pound-force.
const NEWTONS_PER_LBF: f64 = 4.44822;

/// Commands accepted by the mat interface board. Each is sent as a single
/// newline-terminated ASCII line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Leave the command loop and stream frames continuously.
    StartReading,
    /// Perform one read of the mat and transmit it.
    GetCalVals,
    /// Ask the board to print its firmware banner.
    PrintInfo,
}

impl Command {
    /// The wire form of the command, without the trailing newline.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartReading => "start_reading",
            Command::GetCalVals => "get_cal_vals",
            Command::PrintInfo => "print_info",
        }
    }

    /// The exact bytes written to the link.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = self.as_str().as_bytes().to_vec();
        line.push(b'\n');
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Converts pounds-force to newtons.
pub fn lbs_to_newtons(force_lbs: f64) -> f64 {
    force_lbs * NEWTONS_PER_LBF
}

/// Pressure seen by every sensor when `force_lbs` is spread evenly over the
/// whole mat, in pascals.
///
/// Pressure is intensive: a uniform load produces the same pressure at every
/// point of the mat, so each sensor sees the total force over the mat area.
pub fn distributed_lbs_to_sensor_pressure(force_lbs: f64) -> f64 {
    lbs_to_newtons(force_lbs) / MAT_AREA_SQM
}

/// Force carried by a single sensor under a uniform load of `force_lbs`, in
/// newtons.
pub fn distributed_lbs_to_sensor_force(force_lbs: f64) -> f64 {
    distributed_lbs_to_sensor_pressure(force_lbs) * SENSOR_AREA_SQM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_dimensions_agree() {
        assert_eq!(FRAME_SIZE, 1568);
        assert_eq!(FRAME_BUFFER_LEN, 1572);
    }

    #[test]
    fn commands_are_newline_terminated() {
        assert_eq!(Command::StartReading.to_line(), b"start_reading\n".to_vec());
        assert_eq!(Command::GetCalVals.to_line(), b"get_cal_vals\n".to_vec());
        assert_eq!(Command::PrintInfo.to_string(), "print_info");
    }

    #[test]
    fn uniform_load_pressure_is_force_over_mat_area() {
        let pressure = distributed_lbs_to_sensor_pressure(10.0);
        assert!((pressure - 44.4822 / 0.1568).abs() < 1e-9);

        // summing the per-sensor force over the mat area gives back the load
        let sensors_on_mat = MAT_AREA_SQM / SENSOR_AREA_SQM;
        let total = distributed_lbs_to_sensor_force(10.0) * sensors_on_mat;
        assert!((total - lbs_to_newtons(10.0)).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_is_zero_pressure() {
        assert_eq!(distributed_lbs_to_sensor_pressure(0.0), 0.0);
    }
}
