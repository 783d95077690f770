use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result codes the remote service uses for "no threat found".
pub const CLEAN_RESULT_CODES: [i64; 2] = [0, 7];

/// Point-in-time snapshot of remote scan progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Position in the remote queue (0 once scanning started).
    pub queue_position: i64,
    /// Completion percentage reported by the service.
    pub progress_percent: i64,
    /// Aggregated result code across all engines.
    pub result_code: i64,
    /// Human readable label for `result_code`.
    pub result_label: String,
    pub observed_at: DateTime<Utc>,
}

/// Terminal classification of a completed scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    Infected,
}

impl ScanResult {
    /// Completion is driven by the percentage only, never by the result code.
    pub fn is_complete(&self) -> bool {
        self.progress_percent >= 100
    }

    pub fn is_clean(&self) -> bool {
        CLEAN_RESULT_CODES.contains(&self.result_code)
    }

    pub fn verdict(&self) -> Verdict {
        if self.is_clean() {
            Verdict::Clean
        } else {
            Verdict::Infected
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Clean => f.write_str("clean"),
            Verdict::Infected => f.write_str("infected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(progress: i64, code: i64) -> ScanResult {
        ScanResult {
            queue_position: 0,
            progress_percent: progress,
            result_code: code,
            result_label: String::new(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn completion_ignores_result_code() {
        assert!(!result(99, 0).is_complete());
        assert!(result(100, 5).is_complete());
        assert!(result(140, 5).is_complete());
    }

    #[test]
    fn only_codes_zero_and_seven_are_clean() {
        assert_eq!(result(100, 0).verdict(), Verdict::Clean);
        assert_eq!(result(100, 7).verdict(), Verdict::Clean);
        for code in [1, 2, 3, 4, 5, 6, 8, 12, -1] {
            assert_eq!(result(100, code).verdict(), Verdict::Infected, "code {code}");
        }
    }
}
