//! Wall-clock source for hosts. The engine itself only sees `now` arguments.

use chrono::Utc;

use crate::core::types::Timestamp;

/// Current Unix time in seconds; clocks set before 1970 read as zero.
pub fn now() -> Timestamp {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_plausible_time() {
        // 2020-01-01T00:00:00Z
        assert!(now() > 1_577_836_800);
    }
}
