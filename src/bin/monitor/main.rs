//! Runs an acquisition session against the simulated mat and shows it live.
//! A footprint wanders around the mat until a key is pressed.

use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use matterface::{
    calibration::{CalibrationConfig, CalibrationModel, CurveModel, ReferenceSample},
    dummy_mat::{DummyConfig, DummyMat, Load, DUMMY_PORT},
    grid::SensorGrid,
    mat::{COLS, ROWS},
    session::{AcquisitionSession, SessionConfig},
    tui::monitor_until_keypress,
};

use log::error;

const PEAK: u8 = 200;
const RADIUS: f64 = 9.0;

/// A straight line from raw 0 at no pressure to `PEAK` at 600 Pa.
fn linear_model() -> CalibrationModel {
    let mut model = CalibrationModel::new(CalibrationConfig {
        curve: CurveModel::Polynomial { degree: 1 },
        ..Default::default()
    });
    let samples = [
        ReferenceSample::new(SensorGrid::filled(0), 0.0),
        ReferenceSample::new(SensorGrid::filled(PEAK), 600.0),
    ];
    if let Err(e) = model.fit(&samples) {
        error!("Could not fit the demo curves: {}", e);
    }
    model
}

fn main() {
    env_logger::init();

    let mat = DummyMat::new(DummyConfig::default());
    let controller = mat.controller();

    let session = AcquisitionSession::new(
        SessionConfig {
            port: DUMMY_PORT.to_owned(),
            output_root: None,
            ..Default::default()
        },
        linear_model().into_shared(),
    );
    let events = session.subscribe();
    let handle = session.start_with_link(mat);

    let walking = Arc::new(AtomicBool::new(true));
    let th_walking = walking.clone();
    let walker = thread::spawn(move || {
        let mut t: f64 = 0.0;
        while th_walking.load(Ordering::SeqCst) {
            controller.set_load(Load::Footprint {
                row: ROWS as f64 / 2.0 + (ROWS as f64 / 3.0) * t.sin(),
                col: COLS as f64 / 2.0 + (COLS as f64 / 3.0) * t.cos(),
                radius: RADIUS,
                peak: PEAK,
            });
            t = (t + 0.05) % TAU;
            thread::sleep(Duration::from_millis(50));
        }
    });

    match monitor_until_keypress("Simulated Mat", events, handle, None) {
        Ok((state, result)) => {
            if let Some(stats) = state.final_stats {
                println!("{}", stats.final_message());
            }
            if let Err(e) = result {
                error!("Session failed: {}", e);
            }
        }
        Err(e) => error!("Monitor failed: {}", e),
    }

    walking.store(false, Ordering::SeqCst);
    if walker.join().is_err() {
        error!("Footprint thread panicked");
    }
}
