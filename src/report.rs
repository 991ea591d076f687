/// Console and JSON rendering of a `ResultSet`.
///
/// Console layout:
///   results (length: N) {c0, c1, ...}
///   debug (length: 20) {           <- diagnostic mode only
///   name : value,
///   }
///   GPU elapsed: … ns / CPU elapsed: … ns   <- when timing was recorded
use std::fmt;

use crate::memory::DIAGNOSTIC_LEN;
use crate::results::ResultSet;

/// `Display` adapter producing the console layout.
pub struct ConsoleReport<'a>(pub &'a ResultSet);

impl fmt::Display for ConsoleReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rs = self.0;
        write!(f, "results (length: {}) {{", rs.result_len)?;
        for (i, count) in rs.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{count}")?;
        }
        writeln!(f, "}}")?;

        if let Some(diag) = &rs.diagnostics {
            writeln!(f, "debug (length: {DIAGNOSTIC_LEN}) {{")?;
            for (label, value) in diag.labeled() {
                writeln!(f, "{label} : {value:6.4},")?;
            }
            writeln!(f, "}}")?;
        }

        if let Some(ns) = rs.device_elapsed_ns {
            writeln!(f, "GPU elapsed: {ns} ns")?;
        }
        if let Some(ns) = rs.host_elapsed_ns {
            writeln!(f, "CPU elapsed: {ns} ns")?;
        }
        Ok(())
    }
}

/// Pretty-printed JSON of the whole result set.
pub fn to_json(rs: &ResultSet) -> serde_json::Result<String> {
    serde_json::to_string_pretty(rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::Diagnostics;

    #[test]
    fn release_report_is_a_single_brace_list() {
        let rs = ResultSet {
            results: vec![0, 3, 1],
            result_len: 3,
            device_elapsed_ns: None,
            host_elapsed_ns: None,
            diagnostics: None,
        };
        assert_eq!(
            ConsoleReport(&rs).to_string(),
            "results (length: 3) {0, 3, 1}\n"
        );
    }

    #[test]
    fn diagnostic_report_lists_scalars_with_four_decimals() {
        let mut values = [0.0f32; DIAGNOSTIC_LEN];
        values[0] = 7.0;
        let rs = ResultSet {
            results: vec![5],
            result_len: 1,
            device_elapsed_ns: Some(1500),
            host_elapsed_ns: Some(2500),
            diagnostics: Some(Diagnostics::new(values)),
        };
        let text = ConsoleReport(&rs).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "results (length: 1) {5}");
        assert_eq!(lines[1], "debug (length: 20) {");
        assert_eq!(lines[2], "dropletsRemaining : 7.0000,");
        assert_eq!(lines[3], "RNGRESERVED : 0.0000,");
        assert_eq!(lines[22], "}");
        assert_eq!(lines[23], "GPU elapsed: 1500 ns");
        assert_eq!(lines[24], "CPU elapsed: 2500 ns");
    }

    #[test]
    fn json_report_carries_optional_fields_as_null() {
        let rs = ResultSet {
            results: vec![1, 2],
            result_len: 2,
            device_elapsed_ns: None,
            host_elapsed_ns: None,
            diagnostics: None,
        };
        let value: serde_json::Value = serde_json::from_str(&to_json(&rs).unwrap()).unwrap();
        assert_eq!(value["result_len"], 2);
        assert_eq!(value["results"][1], 2);
        assert!(value["diagnostics"].is_null());
    }
}
