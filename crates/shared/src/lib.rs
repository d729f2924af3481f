pub mod domain;
pub mod error;
pub mod protocol;

/// Current wall-clock time in epoch milliseconds, the unit every platform timestamp uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod domain_tests;
