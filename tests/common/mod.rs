//! Shared helpers for the integration suites.

use std::time::Duration;

/// Base time unit for timing-sensitive tests.
pub const STEP: Duration = Duration::from_millis(100);

/// Assert that a measured duration is close to the expected one.
///
/// The window is asymmetric: sleeps never finish early, but a loaded
/// machine can stretch them.
pub fn assert_elapsed(actual: Duration, expected: Duration) {
    let low = expected.saturating_sub(Duration::from_millis(30));
    let high = expected + Duration::from_millis(250);
    assert!(
        actual >= low && actual <= high,
        "expected ~{expected:?}, got {actual:?}"
    );
}
