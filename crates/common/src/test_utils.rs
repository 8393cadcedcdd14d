//! Test utilities shared across crates
//!
//! # Example
//!
//! ```
//! use common::test_utils::{free_port, wait_until};
//! use std::time::Duration;
//!
//! let port = free_port();
//! assert!(port > 0);
//! assert!(wait_until(Duration::from_millis(50), || true));
//! ```

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask the OS for a currently unused loopback port
///
/// The port is released before returning, so a racing process could take it;
/// good enough for tests.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Find `count` distinct free ports
pub fn free_ports(count: usize) -> Vec<u16> {
    // Hold every listener until all ports are chosen so none repeats.
    let listeners: Vec<TcpListener> = (0..count)
        .filter_map(|_| TcpListener::bind("127.0.0.1:0").ok())
        .collect();
    listeners
        .iter()
        .filter_map(|l| l.local_addr().ok())
        .map(|addr| addr.port())
        .collect()
}

/// Find `len` consecutive free ports and return the first
///
/// Like [`free_port`], the ports are released before returning.
pub fn free_port_block(len: u16) -> u16 {
    for _ in 0..64 {
        let start = free_port();
        let Some(end) = start.checked_add(len) else {
            continue;
        };
        let held: Vec<TcpListener> = (start..end)
            .map_while(|port| TcpListener::bind(("127.0.0.1", port)).ok())
            .collect();
        if start != 0 && held.len() == usize::from(len) {
            return start;
        }
    }
    0
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
