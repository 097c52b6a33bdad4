//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;

/// How long a test waits for the engine before giving up
pub fn test_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Short pause for "nothing should happen" checks
pub fn settle_time() -> Duration {
    Duration::from_millis(150)
}
