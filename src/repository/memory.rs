use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::ReservationRepository;
use crate::error::AppResult;
use crate::models::{NewReservation, Reservation};

/// In-memory reservation store.
///
/// Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct InMemoryReservationRepository {
    rows: Arc<RwLock<BTreeMap<u64, Reservation>>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryReservationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ReservationRepository for InMemoryReservationRepository {
    async fn save(&self, reservation: NewReservation) -> AppResult<Reservation> {
        let mut rows = self.rows.write().await;
        let saved = Reservation {
            id: self.next_id(),
            name: reservation.name,
        };
        rows.insert(saved.id, saved.clone());
        trace!(id = saved.id, "Reservation saved");
        Ok(saved)
    }

    async fn save_all(&self, reservations: Vec<NewReservation>) -> AppResult<Vec<Reservation>> {
        // One write lock for the whole batch
        let mut rows = self.rows.write().await;
        let saved: Vec<Reservation> = reservations
            .into_iter()
            .map(|r| Reservation {
                id: self.next_id(),
                name: r.name,
            })
            .collect();

        for reservation in &saved {
            rows.insert(reservation.id, reservation.clone());
        }
        trace!(count = saved.len(), "Reservations saved");
        Ok(saved)
    }

    async fn find_all(&self) -> AppResult<Vec<Reservation>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn find_by_id(&self, id: u64) -> AppResult<Option<Reservation>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> AppResult<Vec<Reservation>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn delete_by_id(&self, id: u64) -> AppResult<bool> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }

    async fn delete_all(&self) -> AppResult<()> {
        self.rows.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.rows.read().await.len())
    }
}
