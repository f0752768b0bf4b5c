//! Connection state of the requester, coordinating reconnection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::metrics;

/// Connection state tracking for reconnection management.
///
/// # Generations
///
/// Every established connection gets a new generation number. A reader task
/// that notices its socket closed only marks the state disconnected if its
/// generation is still the current one, so a late close of a replaced
/// connection cannot flip a healthy requester to disconnected.
///
/// # Reconnection Coordination
///
/// Uses `tokio::sync::Notify` to wake waiting tasks when reconnection
/// completes, avoiding busy-wait polling.
pub struct ConnectionState {
    connected: AtomicBool,
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    reconnecting: AtomicBool,
    reconnect_complete: Notify,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            reconnect_complete: Notify::new(),
        }
    }

    /// Record a freshly established connection, returning its generation.
    pub fn mark_connected(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        metrics::set_rpc_connection_status(true);
        generation
    }

    /// Record that the connection of `generation` is gone.
    pub fn mark_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.connected.store(false, Ordering::SeqCst);
            metrics::set_rpc_connection_status(false);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn increment_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    /// Returns true if this call started the reconnection (none was in progress).
    pub fn start_reconnecting(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::SeqCst)
    }

    pub fn stop_reconnecting(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        self.reconnect_complete.notify_waiters();
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Wait for an ongoing reconnection to complete.
    ///
    /// Returns immediately if no reconnection is in progress. Registers for
    /// the notification before checking, so a reconnection finishing in
    /// between cannot be missed.
    pub async fn wait_for_reconnection(&self) {
        let notified = self.reconnect_complete.notified();
        if self.is_reconnecting() {
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks reconnection finished when dropped, including on early return.
pub(crate) struct ReconnectGuard<'a>(pub(crate) &'a ConnectionState);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.stop_reconnecting();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_connection_state_initial() {
        let state = ConnectionState::new();

        assert!(!state.is_connected());
        assert!(!state.is_reconnecting());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn test_mark_connected_resets_attempts() {
        let state = ConnectionState::new();
        state.increment_attempts();
        state.increment_attempts();
        assert_eq!(state.attempts(), 2);

        state.mark_connected();
        assert!(state.is_connected());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn test_stale_generation_does_not_disconnect() {
        let state = ConnectionState::new();
        let old = state.mark_connected();
        let current = state.mark_connected();

        state.mark_lost(old);
        assert!(state.is_connected());

        state.mark_lost(current);
        assert!(!state.is_connected());
    }

    #[test]
    fn test_start_reconnecting_is_exclusive() {
        let state = ConnectionState::new();

        assert!(state.start_reconnecting());
        assert!(!state.start_reconnecting());

        state.stop_reconnecting();
        assert!(state.start_reconnecting());
    }

    #[test]
    fn test_guard_stops_reconnecting() {
        let state = ConnectionState::new();
        state.start_reconnecting();
        {
            let _guard = ReconnectGuard(&state);
        }
        assert!(!state.is_reconnecting());
    }

    #[tokio::test]
    async fn test_wait_for_reconnection_not_reconnecting() {
        let state = ConnectionState::new();

        tokio::time::timeout(Duration::from_millis(100), state.wait_for_reconnection())
            .await
            .expect("wait_for_reconnection should return immediately when not reconnecting");
    }

    #[tokio::test]
    async fn test_waiters_are_woken() {
        let state = Arc::new(ConnectionState::new());
        state.start_reconnecting();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.wait_for_reconnection().await;
                state.is_connected()
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.mark_connected();
        state.stop_reconnecting();

        for handle in handles {
            let connected = tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .expect("waiter timed out")
                .expect("waiter panicked");
            assert!(connected);
        }
    }
}
