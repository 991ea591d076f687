/// Host-side results of one run.
use serde::Serialize;

use crate::memory::DIAGNOSTIC_LEN;

/// Names of the diagnostic slots the kernel fills, in buffer order.
/// Slots past the end of this list are reserved and reported by index.
pub const DIAGNOSTIC_NAMES: [&str; 14] = [
    "dropletsRemaining",
    "RNGRESERVED",
    "LOCALSIZE",
    "GLOBALSIZE",
    "PHOTONSPERINTENSITYPERTIME",
    "ENDTIME",
    "DEBUGSIZE",
    "intensity_0",
    "CDFphoton_0",
    "CDFI_0",
    "dT_0",
    "position_0.x",
    "position_0.y",
    "position_0.z",
];

/// Buffer index of each named diagnostic slot.
pub mod slot {
    pub const DROPLETS_REMAINING: usize = 0;
    pub const RNG_RESERVED: usize = 1;
    pub const LOCAL_SIZE: usize = 2;
    pub const GLOBAL_SIZE: usize = 3;
    pub const PHOTON_RATE: usize = 4;
    pub const END_TIME: usize = 5;
    pub const DEBUG_SIZE: usize = 6;
    pub const INTENSITY: usize = 7;
    pub const CDF_PHOTON: usize = 8;
    pub const CDF_INTENSITY: usize = 9;
    pub const DT: usize = 10;
    pub const POSITION_X: usize = 11;
    pub const POSITION_Y: usize = 12;
    pub const POSITION_Z: usize = 13;
}

/// Diagnostic scalars read back from the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    values: [f32; DIAGNOSTIC_LEN],
}

impl Diagnostics {
    pub fn new(values: [f32; DIAGNOSTIC_LEN]) -> Self {
        Diagnostics { values }
    }

    pub fn values(&self) -> &[f32; DIAGNOSTIC_LEN] {
        &self.values
    }

    /// Look up a named slot.
    pub fn get(&self, name: &str) -> Option<f32> {
        DIAGNOSTIC_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }

    /// Every slot with its label, in buffer order.
    pub fn labeled(&self) -> impl Iterator<Item = (String, f32)> + '_ {
        self.values.iter().enumerate().map(|(i, &v)| {
            let label = DIAGNOSTIC_NAMES
                .get(i)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("reserved_{i}"));
            (label, v)
        })
    }
}

/// Everything a run produces.
///
/// `device_elapsed_ns`, `host_elapsed_ns` and `diagnostics` are only filled
/// in diagnostic mode; `None` is the release-mode value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    /// Histogram counters, `workgroups × bins` long, grouped by work-group
    pub results: Vec<u64>,
    pub result_len: usize,
    pub device_elapsed_ns: Option<u64>,
    pub host_elapsed_ns: Option<u64>,
    pub diagnostics: Option<Diagnostics>,
}

impl ResultSet {
    /// Bins owned by work-group `group`, or `None` past the last group.
    pub fn workgroup(&self, group: usize, bins_per_workgroup: usize) -> Option<&[u64]> {
        let start = group.checked_mul(bins_per_workgroup)?;
        self.results.get(start..start + bins_per_workgroup)
    }

    /// Sum of every counter.
    pub fn total_counts(&self) -> u64 {
        self.results.iter().sum()
    }

    /// Bin-wise sum over all work-groups.
    pub fn aggregate(&self, bins_per_workgroup: usize) -> Vec<u64> {
        let mut total = vec![0u64; bins_per_workgroup];
        if bins_per_workgroup == 0 {
            return total;
        }
        for group in self.results.chunks(bins_per_workgroup) {
            for (acc, &count) in total.iter_mut().zip(group) {
                *acc += count;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet {
            results: vec![1, 2, 3, 4, 5, 6],
            result_len: 6,
            device_elapsed_ns: None,
            host_elapsed_ns: None,
            diagnostics: None,
        }
    }

    #[test]
    fn workgroup_slices_partition_results() {
        let rs = sample();
        assert_eq!(rs.workgroup(0, 3), Some(&[1, 2, 3][..]));
        assert_eq!(rs.workgroup(1, 3), Some(&[4, 5, 6][..]));
        assert_eq!(rs.workgroup(2, 3), None);
    }

    #[test]
    fn aggregate_sums_bins_across_groups() {
        let rs = sample();
        assert_eq!(rs.aggregate(3), vec![5, 7, 9]);
        assert_eq!(rs.total_counts(), 21);
    }

    #[test]
    fn diagnostics_label_every_slot() {
        let mut values = [0.0f32; DIAGNOSTIC_LEN];
        values[slot::END_TIME] = 10.0;
        let diag = Diagnostics::new(values);
        assert_eq!(diag.get("ENDTIME"), Some(10.0));
        assert_eq!(diag.get("nope"), None);
        let labels: Vec<String> = diag.labeled().map(|(l, _)| l).collect();
        assert_eq!(labels.len(), DIAGNOSTIC_LEN);
        assert_eq!(labels[0], "dropletsRemaining");
        assert_eq!(labels[13], "position_0.z");
        assert_eq!(labels[14], "reserved_14");
    }
}
