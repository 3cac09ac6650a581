use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub const GAIN_MIN: f32 = 0.5;
pub const GAIN_MAX: f32 = 2.0;
pub const HUE_MIN: f32 = 0.0;
pub const HUE_MAX: f32 = 360.0;

/// Normalized image adjustments applied by the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            contrast: 1.0,
            saturation: 1.0,
            hue: 0.0,
        }
    }
}

impl Calibration {
    pub fn clamped(self) -> Self {
        Self {
            brightness: clamp_gain(self.brightness),
            contrast: clamp_gain(self.contrast),
            saturation: clamp_gain(self.saturation),
            hue: clamp_hue(self.hue),
        }
    }

    pub fn apply(&self, update: &CalibrationUpdate) -> Self {
        Self {
            brightness: update.brightness.unwrap_or(self.brightness),
            contrast: update.contrast.unwrap_or(self.contrast),
            saturation: update.saturation.unwrap_or(self.saturation),
            hue: update.hue.unwrap_or(self.hue),
        }
        .clamped()
    }
}

fn clamp_gain(v: f32) -> f32 {
    if v.is_nan() {
        return 1.0;
    }
    v.clamp(GAIN_MIN, GAIN_MAX)
}

fn clamp_hue(v: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(HUE_MIN, HUE_MAX)
}

/// Partial calibration change; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationUpdate {
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub saturation: Option<f32>,
    pub hue: Option<f32>,
}

/// Target band for auto-calibration, as mean brightness in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightnessBand {
    pub low: f32,
    pub high: f32,
}

impl Default for BrightnessBand {
    fn default() -> Self {
        Self {
            low: 0.4,
            high: 0.6,
        }
    }
}

impl BrightnessBand {
    pub fn center(&self) -> f32 {
        (self.low + self.high) / 2.0
    }

    pub fn contains(&self, v: f32) -> bool {
        v >= self.low && v <= self.high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCalibrationReport {
    pub samples: usize,
    pub average_brightness: f32,
    pub previous: Calibration,
    pub applied: Calibration,
    pub adjusted: bool,
}

/// Estimates scene brightness from recent frames and nudges brightness and
/// contrast toward `band`. Returns `None` when no frame carries brightness.
pub fn auto_calibrate<'a>(
    current: Calibration,
    frames: impl IntoIterator<Item = &'a Frame>,
    band: BrightnessBand,
) -> Option<AutoCalibrationReport> {
    let readings: Vec<f32> = frames.into_iter().filter_map(|f| f.brightness()).collect();
    if readings.is_empty() {
        return None;
    }
    let average = readings.iter().sum::<f32>() / readings.len() as f32;

    let applied = if band.contains(average) {
        current
    } else {
        let delta = band.center() - average;
        Calibration {
            brightness: current.brightness + delta,
            contrast: current.contrast + delta / 2.0,
            ..current
        }
        .clamped()
    };

    Some(AutoCalibrationReport {
        samples: readings.len(),
        average_brightness: average,
        previous: current,
        applied,
        adjusted: applied != current,
    })
}
