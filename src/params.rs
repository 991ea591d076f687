/// Run parameters for a single simulation launch.
///
/// Immutable for the duration of one run. Every field has a default, so a
/// JSON config only needs to name the values it overrides.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FcsError};

const NANOS_PER_SECOND: f64 = 1e9;

/// 2^64 as f64: the first value that no longer fits a u64 nanosecond count.
const U64_LIMIT: f64 = 18_446_744_073_709_551_616.0;

/// Largest accepted photon rate. Keeps the photons emitted in one 10 µs
/// kernel step in the tens of thousands.
pub const MAX_PHOTON_RATE: f32 = 1.0e9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunParameters {
    /// Droplets to simulate across the whole grid (seeds the countdown counter)
    pub total_droplets: u32,
    /// Number of work-groups in the launch grid
    pub workgroups: u32,
    /// Work-items per work-group (also the local work-group size)
    pub workitems: u32,
    /// Simulated time per droplet, in seconds
    pub end_time: f64,
    /// Photon emission rate per unit beam intensity per second
    pub photons_per_intensity_per_time: f32,
    /// Histogram bins owned by each work-group in global memory
    pub global_buffer_size_per_workgroup: u32,
    /// u32 slots of local scratch owned by each work-item
    pub local_buffer_size_per_workitem: u32,
}

impl Default for RunParameters {
    fn default() -> Self {
        RunParameters {
            total_droplets: 1,
            workgroups: 1,
            workitems: 1,
            end_time: 10.0,
            photons_per_intensity_per_time: 1.0,
            global_buffer_size_per_workgroup: 1000,
            local_buffer_size_per_workitem: 1000,
        }
    }
}

impl RunParameters {
    pub fn with_total_droplets(mut self, total_droplets: u32) -> Self {
        self.total_droplets = total_droplets;
        self
    }

    pub fn with_grid(mut self, workgroups: u32, workitems: u32) -> Self {
        self.workgroups = workgroups;
        self.workitems = workitems;
        self
    }

    pub fn with_end_time(mut self, end_time: f64) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_photon_rate(mut self, photons_per_intensity_per_time: f32) -> Self {
        self.photons_per_intensity_per_time = photons_per_intensity_per_time;
        self
    }

    pub fn with_global_capacity(mut self, bins_per_workgroup: u32) -> Self {
        self.global_buffer_size_per_workgroup = bins_per_workgroup;
        self
    }

    pub fn with_local_capacity(mut self, slots_per_workitem: u32) -> Self {
        self.local_buffer_size_per_workitem = slots_per_workitem;
        self
    }

    /// Parse parameters from a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load parameters from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FcsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Ok(Self::from_json_str(&text)?)
    }

    /// Check every field independently of any device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("total_droplets", self.total_droplets, 1)?;
        at_least("workgroups", self.workgroups, 1)?;
        at_least("workitems", self.workitems, 1)?;
        at_least(
            "global_buffer_size_per_workgroup",
            self.global_buffer_size_per_workgroup,
            1,
        )?;
        at_least(
            "local_buffer_size_per_workitem",
            self.local_buffer_size_per_workitem,
            1,
        )?;
        let rate = self.photons_per_intensity_per_time;
        if !rate.is_finite() || !(0.0..=MAX_PHOTON_RATE).contains(&rate) {
            return Err(ConfigError::InvalidPhotonRate(rate));
        }
        self.end_time_ns()?;
        Ok(())
    }

    /// End time as an integer nanosecond count, truncated toward zero.
    ///
    /// Values that would not fit a u64, or that truncate to zero, are
    /// rejected rather than wrapped.
    pub fn end_time_ns(&self) -> Result<u64, ConfigError> {
        let seconds = self.end_time;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ConfigError::InvalidEndTime(seconds));
        }
        let nanos = seconds * NANOS_PER_SECOND;
        if nanos >= U64_LIMIT {
            return Err(ConfigError::EndTimeOverflow(seconds));
        }
        if nanos < 1.0 {
            return Err(ConfigError::InvalidEndTime(seconds));
        }
        Ok(nanos as u64)
    }

    /// Number of u64 counters in the result buffer.
    pub fn result_len(&self) -> Result<usize, ConfigError> {
        (self.workgroups as usize)
            .checked_mul(self.global_buffer_size_per_workgroup as usize)
            .ok_or_else(|| ConfigError::Overflow {
                what: "result length",
                detail: format!(
                    "{} workgroups x {} bins",
                    self.workgroups, self.global_buffer_size_per_workgroup
                ),
            })
    }
}

fn at_least(field: &'static str, value: u32, min: u32) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall {
            field,
            min: min as u64,
            value: value as u64,
        });
    }
    Ok(())
}
