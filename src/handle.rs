//! Pool bookkeeping wrapped around each live connection

use std::sync::Arc;
use tokio::time::Instant;

use crate::connection::ConnectionId;

/// A connection plus the pool's usage record for it
///
/// Handles never leave the pool; callers only ever see the `Arc` to the
/// connection inside a lease.
pub(crate) struct PooledHandle<C> {
    pub id: ConnectionId,
    pub conn: Arc<C>,
    pub created_at: Instant,
    pub last_borrowed_at: Instant,
    pub last_returned_at: Instant,
    pub last_health_checked_at: Instant,
    pub borrow_count: u64,
}

impl<C> PooledHandle<C> {
    /// Wrap a freshly created connection, already borrowed by its creator
    ///
    /// A new connection counts as just checked: it finished its handshake a
    /// moment ago.
    pub fn new_borrowed(conn: C, now: Instant) -> Self {
        Self {
            id: ConnectionId::next(),
            conn: Arc::new(conn),
            created_at: now,
            last_borrowed_at: now,
            last_returned_at: now,
            last_health_checked_at: now,
            borrow_count: 1,
        }
    }

    pub fn mark_borrowed(&mut self, now: Instant) {
        self.last_borrowed_at = now;
        self.borrow_count += 1;
    }

    pub fn mark_returned(&mut self, now: Instant) {
        self.last_returned_at = now;
    }

    pub fn mark_health_checked(&mut self, now: Instant) {
        self.last_health_checked_at = now;
    }

    /// How long the handle has sat unused since its last return
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_returned_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lifecycle_stamps() {
        let start = Instant::now();
        let mut handle = PooledHandle::new_borrowed("session", start);
        assert_eq!(handle.borrow_count, 1);
        assert_eq!(handle.last_borrowed_at, start);

        let later = start + Duration::from_secs(5);
        handle.mark_returned(later);
        assert_eq!(handle.idle_for(later + Duration::from_secs(3)), Duration::from_secs(3));

        handle.mark_borrowed(later + Duration::from_secs(4));
        assert_eq!(handle.borrow_count, 2);
        assert_eq!(handle.last_borrowed_at, later + Duration::from_secs(4));
    }

    #[test]
    fn test_idle_for_never_underflows() {
        let start = Instant::now();
        let handle = PooledHandle::new_borrowed((), start + Duration::from_secs(1));
        assert_eq!(handle.idle_for(start), Duration::ZERO);
    }
}
