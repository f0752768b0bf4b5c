//! Reservation storage.
//!
//! Handlers and services only see the [`ReservationRepository`] trait, held as
//! `Arc<dyn ReservationRepository>`. The in-memory implementation is the only
//! one shipped; a database-backed store would slot in behind the same trait.

mod memory;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{NewReservation, Reservation};

pub use memory::InMemoryReservationRepository;

/// CRUD operations over reservations.
///
/// All listing operations return reservations ordered by id.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Store one reservation, assigning the next id.
    async fn save(&self, reservation: NewReservation) -> AppResult<Reservation>;

    /// Store several reservations atomically, preserving input order.
    ///
    /// Concurrent readers observe either none or all of them.
    async fn save_all(&self, reservations: Vec<NewReservation>) -> AppResult<Vec<Reservation>>;

    async fn find_all(&self) -> AppResult<Vec<Reservation>>;

    async fn find_by_id(&self, id: u64) -> AppResult<Option<Reservation>>;

    /// Exact, case-sensitive name match.
    async fn find_by_name(&self, name: &str) -> AppResult<Vec<Reservation>>;

    /// Returns `true` if a reservation was removed.
    async fn delete_by_id(&self, id: u64) -> AppResult<bool>;

    /// Remove every reservation. The id sequence keeps counting.
    async fn delete_all(&self) -> AppResult<()>;

    async fn count(&self) -> AppResult<usize>;
}
