//! Connection liveness watchdog.
//!
//! Every interval tick sends a transport ping; a peer that fails to answer
//! before the next tick gets a best-effort close with the ping-timeout code
//! and is forcibly terminated. One watchdog per attached connection,
//! started when the connection reaches its room and stopped on detach.

use crate::connection::ConnHandle;
use crate::protocol::close_code;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Watchdog {
    awaiting_pong: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn start(conn: ConnHandle, interval: Duration) -> Watchdog {
        let awaiting_pong = Arc::new(AtomicBool::new(false));
        let flag = awaiting_pong.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !conn.is_up() {
                    break;
                }
                if flag.swap(true, Ordering::SeqCst) {
                    // Previous ping was never answered.
                    log::debug!(
                        "connection {}: no pong within {:?}, terminating",
                        conn.id(),
                        interval
                    );
                    conn.close(close_code::PING_TIMEOUT);
                    conn.terminate();
                    break;
                }
                conn.ping();
            }
        });
        Watchdog {
            awaiting_pong,
            task,
        }
    }

    /// Record a pong from the peer, resetting the timeout.
    pub fn pong_received(&self) {
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{self, ConnState, Outgoing};

    #[tokio::test]
    async fn test_unanswered_ping_closes_with_timeout_code_and_terminates() {
        let (conn, mut transport) = connection::pair();
        transport.mark_open();
        let _watchdog = Watchdog::start(conn.handle().clone(), Duration::from_millis(10));

        assert_eq!(transport.next_outgoing().await, Some(Outgoing::Ping));
        assert_eq!(
            transport.next_outgoing().await,
            Some(Outgoing::Close(close_code::PING_TIMEOUT))
        );
        assert_eq!(transport.next_outgoing().await, Some(Outgoing::Terminate));
        assert_eq!(conn.handle().state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_the_connection_alive() {
        let (conn, mut transport) = connection::pair();
        transport.mark_open();
        let watchdog = Watchdog::start(conn.handle().clone(), Duration::from_millis(10));

        for _ in 0..5 {
            assert_eq!(transport.next_outgoing().await, Some(Outgoing::Ping));
            watchdog.pong_received();
        }
        assert!(conn.handle().is_up());
    }

    #[tokio::test]
    async fn test_watchdog_stops_once_connection_is_down() {
        let (conn, mut transport) = connection::pair();
        transport.mark_open();
        let watchdog = Watchdog::start(conn.handle().clone(), Duration::from_millis(10));

        conn.handle().close(1000);
        assert_eq!(transport.next_outgoing().await, Some(Outgoing::Close(1000)));

        // The watchdog task exits on its next tick without pinging.
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog.task.abort();
        assert!(watchdog.task.is_finished() || conn.handle().state() == ConnState::Closing);
    }
}
