//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::{Duration, Instant};
use ventilator_console::{ConsoleMessage, MonitorReceiver};

/// Upper bound for waiting on the poll thread
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Receive until `predicate` matches, returning that message
///
/// Panics after [`test_timeout`].
pub fn wait_for<F>(monitor: &MonitorReceiver, mut predicate: F) -> ConsoleMessage
where
    F: FnMut(&ConsoleMessage) -> bool,
{
    let deadline = Instant::now() + test_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match monitor.recv_timeout(remaining) {
            Some(msg) if predicate(&msg) => return msg,
            Some(_) => continue,
            None => panic!("Timed out waiting for console message"),
        }
    }
}

/// Poll `condition` until it holds or the timeout passes
pub fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
