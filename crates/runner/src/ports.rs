//! Local port brokerage for plugin listeners.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::{Result, RunnerError};

const PORT_RANGE_START: u16 = 40000;
const PORT_RANGE_END: u16 = 50000;
const MAX_ATTEMPTS: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Hands out locally unused TCP ports from a bounded range.
///
/// A port is leased when it is not already handed out and a bind-test
/// succeeds. The bind-test listener is closed before the lease is returned,
/// so a race with the plugin re-binding the port remains possible; callers
/// may re-acquire on bind failure.
pub struct PortBroker {
    start: u16,
    end: u16,
    state: Mutex<BrokerState>,
}

struct BrokerState {
    leased: HashSet<u16>,
    cursor: u16,
}

impl PortBroker {
    pub fn new() -> Self {
        Self::with_range(PORT_RANGE_START, PORT_RANGE_END)
    }

    /// Broker over the half-open range `[start, end)`.
    pub fn with_range(start: u16, end: u16) -> Self {
        assert!(start < end, "port range must be non-empty");
        Self {
            start,
            end,
            state: Mutex::new(BrokerState {
                leased: HashSet::new(),
                cursor: start,
            }),
        }
    }

    /// Lease the next free port, advancing a monotonic cursor modulo the
    /// range.
    pub fn acquire(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap();

        for _ in 0..MAX_ATTEMPTS {
            let candidate = state.cursor;
            state.cursor = if candidate + 1 >= self.end {
                self.start
            } else {
                candidate + 1
            };

            if state.leased.contains(&candidate) {
                continue;
            }

            match TcpListener::bind(("0.0.0.0", candidate)) {
                Ok(listener) => {
                    drop(listener);
                    state.leased.insert(candidate);
                    debug!(port = candidate, "port leased");
                    return Ok(candidate);
                }
                Err(_) => continue,
            }
        }

        Err(RunnerError::PortExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Return a lease. Ports outside the managed range are rejected.
    pub fn release(&self, port: u16) -> Result<()> {
        if port < self.start || port >= self.end {
            return Err(RunnerError::InvalidPort {
                port,
                start: self.start,
                end: self.end,
            });
        }
        self.state.lock().unwrap().leased.remove(&port);
        debug!(port, "port released");
        Ok(())
    }

    /// Poll by dial attempts until nothing accepts on `port` any more or the
    /// wait expires.
    pub async fn wait_for_port_free(&self, port: u16, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            match timeout(DIAL_TIMEOUT, TcpStream::connect(("localhost", port))).await {
                Ok(Ok(_)) => tokio::time::sleep(POLL_INTERVAL).await,
                _ => return Ok(()),
            }
        }
        Err(RunnerError::PortStillInUse { port, waited: wait })
    }
}

impl Default for PortBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_advances_and_never_repeats_without_release() {
        let broker = PortBroker::with_range(49730, 49740);
        let first = broker.acquire().unwrap();
        let second = broker.acquire().unwrap();
        let third = broker.acquire().unwrap();
        let leased = [first, second, third];
        assert_eq!(
            leased.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }

    #[test]
    fn released_port_can_be_leased_again() {
        let broker = PortBroker::with_range(49740, 49743);
        let first = broker.acquire().unwrap();
        broker.release(first).unwrap();
        let mut seen = vec![broker.acquire().unwrap(), broker.acquire().unwrap()];
        seen.push(broker.acquire().unwrap());
        assert!(seen.contains(&first));
    }

    #[test]
    fn single_port_range_exhausts_on_second_acquire() {
        let broker = PortBroker::with_range(49871, 49872);
        let port = broker.acquire().unwrap();
        assert_eq!(port, 49871);
        assert!(matches!(
            broker.acquire(),
            Err(RunnerError::PortExhausted { .. })
        ));
    }

    #[test]
    fn out_of_range_release_is_invalid() {
        let broker = PortBroker::new();
        assert!(matches!(
            broker.release(39999),
            Err(RunnerError::InvalidPort { .. })
        ));
        assert!(matches!(
            broker.release(50000),
            Err(RunnerError::InvalidPort { .. })
        ));
        // Upper bound is exclusive; the last in-range port releases fine.
        broker.release(49999).unwrap();
    }

    #[tokio::test]
    async fn wait_for_port_free_returns_once_dialing_fails() {
        let broker = PortBroker::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        broker
            .wait_for_port_free(port, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_port_free_times_out_while_port_is_served() {
        let broker = PortBroker::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = broker
            .wait_for_port_free(port, Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(RunnerError::PortStillInUse { .. })));
        drop(listener);
    }
}
