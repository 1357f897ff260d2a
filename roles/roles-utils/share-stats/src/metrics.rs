//! Hashrate calculation and formatting utilities.

/// Calculate effective hashrate from the valid shares seen in one period.
///
/// # Arguments
///
/// * `valid_shares` - Valid shares accepted during the period
/// * `share_difficulty` - Difficulty every share was issued at
/// * `period_seconds` - Length of the period in seconds
///
/// # Returns
///
/// Hashrate in hashes per second (H/s)
///
/// # Formula
///
/// Hashrate = (valid_shares * share_difficulty) / period_seconds
pub fn effective_hashrate(valid_shares: u64, share_difficulty: f64, period_seconds: u64) -> f64 {
    if period_seconds == 0 {
        0.0
    } else {
        (valid_shares as f64 * share_difficulty) / period_seconds as f64
    }
}

/// Format a hashrate with an SI prefix and two decimals, e.g. `166.67 H/s`.
pub fn format_hashrate(hashrate: f64) -> String {
    const UNITS: &[(f64, &str)] = &[
        (1e18, "EH/s"),
        (1e15, "PH/s"),
        (1e12, "TH/s"),
        (1e9, "GH/s"),
        (1e6, "MH/s"),
        (1e3, "KH/s"),
    ];

    for &(threshold, unit) in UNITS {
        if hashrate >= threshold {
            return format!("{:.2} {}", hashrate / threshold, unit);
        }
    }

    format!("{:.2} H/s", hashrate)
}
