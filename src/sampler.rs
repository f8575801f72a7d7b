//! One-shot reads of the mat, outside of a running session.
//!
//! Calibration and zeroing ask the board for single frames with
//! [`Command::GetCalVals`] rather than streaming. A one-shot read does not
//! resynchronise: a frame with a bad trailer is reported as is, and the
//! caller decides whether to try again.

use crate::calibration::{write_model, PreconditionError, ReferenceSample, SharedCalibration};
use crate::frame_codec::FrameError;
use crate::frame_reader::FrameReader;
use crate::grid::SensorGrid;
use crate::mat::Command;
use crate::mat_link::MatLink;

use log::info;
use std::{borrow::Cow, fmt, thread};

/// Number of frames averaged into the DC offsets by a zeroing pass.
pub const ZEROING_SAMPLES: usize = 10;

/// Why a multi-read task such as zeroing failed.
#[derive(Debug)]
pub enum SamplerError {
    /// Read number `index` failed.
    Frame { index: usize, error: FrameError },
    Precondition(PreconditionError),
}

impl fmt::Display for SamplerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SamplerError::Frame { index, error } => {
                Cow::from(format!("read {} failed: {}", index, error))
            }
            SamplerError::Precondition(e) => Cow::from(e.to_string()),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SamplerError {}

impl From<PreconditionError> for SamplerError {
    fn from(value: PreconditionError) -> Self {
        Self::Precondition(value)
    }
}

/// Asks the board for one frame and reads it.
pub fn sample_once<L: MatLink>(link: &mut L) -> Result<SensorGrid, FrameError> {
    let mut reader = FrameReader::new(link).with_resync_cap(0);
    reader.send_command(Command::GetCalVals)?;
    reader.next_frame()
}

/// Reads one frame taken under `weight_lbs` spread evenly over the mat.
pub fn reference_sample<L: MatLink>(
    link: &mut L,
    weight_lbs: f64,
) -> Result<ReferenceSample, FrameError> {
    Ok(ReferenceSample::from_weight_lbs(sample_once(link)?, weight_lbs))
}

/// Read number `index` of a zeroing pass.
fn zeroing_read<L: MatLink>(
    link: &mut L,
    index: usize,
    count: usize,
) -> Result<SensorGrid, SamplerError> {
    let grid = sample_once(link).map_err(|error| SamplerError::Frame { index, error })?;
    info!("Zeroing sample {}/{}", index + 1, count);
    Ok(grid)
}

/// Takes `count` frames of the unloaded mat and turns them into the model's
/// DC offsets.
///
/// The frames only reach the model once every read has succeeded, so a
/// failed pass leaves both the offsets and the model's zeroing samples as
/// they were.
pub fn collect_zeroing<L: MatLink>(
    model: &SharedCalibration,
    link: &mut L,
    count: usize,
) -> Result<(), SamplerError> {
    let grids = (0..count)
        .map(|index| zeroing_read(link, index, count))
        .collect::<Result<Vec<_>, _>>()?;

    let mut model = write_model(model);
    for grid in grids {
        model.add_zeroing_sample(grid);
    }
    model.compute_dc_offsets()?;
    Ok(())
}

/// Runs [`sample_once`] on its own thread. The link is handed back with the
/// result.
pub fn spawn_sample<L: MatLink + 'static>(
    mut link: L,
) -> thread::JoinHandle<(L, Result<SensorGrid, FrameError>)> {
    thread::spawn(move || {
        let result = sample_once(&mut link);
        (link, result)
    })
}

/// Runs a full [`ZEROING_SAMPLES`] zeroing pass on its own thread.
pub fn spawn_zeroing<L: MatLink + 'static>(
    model: SharedCalibration,
    mut link: L,
) -> thread::JoinHandle<(L, Result<(), SamplerError>)> {
    thread::spawn(move || {
        let result = collect_zeroing(&model, &mut link, ZEROING_SAMPLES);
        (link, result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationConfig, CalibrationModel};
    use crate::frame_codec::encode;
    use crate::mat::FRAME_BUFFER_LEN;
    use crate::mat_link::testing::ScriptedLink;

    fn frame(value: u8) -> Vec<u8> {
        encode(&SensorGrid::filled(value)).to_vec()
    }

    #[test]
    fn one_shot_sends_the_command() {
        let mut link = ScriptedLink::new(frame(9));
        let written = link.written.clone();

        assert_eq!(sample_once(&mut link).unwrap(), SensorGrid::filled(9));
        assert_eq!(*written.lock().unwrap(), b"get_cal_vals\n".to_vec());
    }

    #[test]
    fn one_shot_reports_a_bad_trailer() {
        let mut link = ScriptedLink::new(vec![1u8; FRAME_BUFFER_LEN]);
        assert!(matches!(
            sample_once(&mut link),
            Err(FrameError::BadTrailer { found: [1, 1, 1, 1] })
        ));
    }

    #[test]
    fn one_shot_times_out() {
        let mut link = ScriptedLink::from_chunks(vec![vec![]]);
        assert!(matches!(sample_once(&mut link), Err(FrameError::Timeout)));
    }

    #[test]
    fn reference_sample_converts_the_weight() {
        let mut link = ScriptedLink::new(frame(30));
        let sample = reference_sample(&mut link, 10.0).unwrap();
        assert_eq!(sample.grid, SensorGrid::filled(30));
        assert!((sample.pressure_pa - 44.4822 / 0.1568).abs() < 1e-9);
    }

    #[test]
    fn zeroing_takes_exactly_ten_reads() {
        let bytes: Vec<u8> = (0..ZEROING_SAMPLES as u8).flat_map(frame).collect();
        let model = CalibrationModel::new(CalibrationConfig::default()).into_shared();

        let (link, result) = spawn_zeroing(model.clone(), ScriptedLink::new(bytes))
            .join()
            .unwrap();
        result.unwrap();

        let commands = link.written.lock().unwrap().clone();
        assert_eq!(
            commands,
            b"get_cal_vals\n".repeat(ZEROING_SAMPLES)
        );
        assert!(link.chunks.is_empty());

        let model = model.read().unwrap();
        assert_eq!(model.zeroing_sample_count(), 0);
        assert_eq!(model.dc_offsets()[(0, 0)], 4.5);
    }

    #[test]
    fn zeroing_stops_at_the_first_failed_read() {
        let mut bytes: Vec<u8> = (0..3).flat_map(frame).collect();
        bytes.extend(vec![0u8; FRAME_BUFFER_LEN]);
        let model = CalibrationModel::new(CalibrationConfig::default()).into_shared();

        let mut link = ScriptedLink::new(bytes);
        match collect_zeroing(&model, &mut link, ZEROING_SAMPLES) {
            Err(SamplerError::Frame { index, .. }) => assert_eq!(index, 3),
            other => panic!("expected a failed read, got {:?}", other),
        }
        let model = model.read().unwrap();
        assert_eq!(model.zeroing_sample_count(), 0);
        assert_eq!(model.dc_offsets()[(0, 0)], 0.0);
    }

    #[test]
    fn failed_pass_does_not_leak_into_the_next() {
        let mut bytes: Vec<u8> = (0..3).flat_map(|_| frame(200)).collect();
        bytes.extend(vec![0u8; FRAME_BUFFER_LEN]);
        bytes.extend((0..ZEROING_SAMPLES).flat_map(|_| frame(0)));
        let model = CalibrationModel::new(CalibrationConfig::default()).into_shared();

        let mut link = ScriptedLink::new(bytes);
        assert!(collect_zeroing(&model, &mut link, ZEROING_SAMPLES).is_err());
        collect_zeroing(&model, &mut link, ZEROING_SAMPLES).unwrap();

        let model = model.read().unwrap();
        assert_eq!(model.zeroing_sample_count(), 0);
        assert!(model.dc_offsets().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn spawned_sample_hands_the_link_back() {
        let (link, result) = spawn_sample(ScriptedLink::new(frame(2))).join().unwrap();
        assert_eq!(result.unwrap(), SensorGrid::filled(2));
        assert_eq!(*link.written.lock().unwrap(), b"get_cal_vals\n".to_vec());
    }
}
