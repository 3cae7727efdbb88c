//! Ledger timestamp helper.

/// Current unix time in whole seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
