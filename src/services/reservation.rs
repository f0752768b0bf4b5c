use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{NewReservation, Reservation};
use crate::repository::ReservationRepository;
use crate::validation::{validate_batch_size, validate_reservation_name};

/// Validated reservation operations on top of a repository.
#[derive(Clone)]
pub struct ReservationService {
    repository: Arc<dyn ReservationRepository>,
}

impl ReservationService {
    pub fn new(repository: Arc<dyn ReservationRepository>) -> Self {
        Self { repository }
    }

    /// Store one reservation.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str) -> AppResult<Reservation> {
        validate_reservation_name(name)?;

        let saved = self.repository.save(NewReservation::new(name)).await?;
        metrics::record_reservations_saved("single", 1);
        info!(id = saved.id, "Reservation created");
        Ok(saved)
    }

    /// Store every name or none of them.
    ///
    /// All names are validated before anything is written, and the batch is
    /// written in one repository call.
    #[instrument(skip(self, names), fields(batch_size = names.len()))]
    pub async fn save_all_by_name(&self, names: &[String]) -> AppResult<Vec<Reservation>> {
        validate_batch_size(names.len())?;
        for name in names {
            validate_reservation_name(name).map_err(|e| match e {
                AppError::BadRequest(msg) => AppError::BadRequest(format!("{msg}: '{name}'")),
                other => other,
            })?;
        }

        let saved = self
            .repository
            .save_all(names.iter().map(NewReservation::new).collect())
            .await?;
        metrics::record_reservations_saved("batch", saved.len() as u64);
        Ok(saved)
    }

    /// All reservations, or only those named exactly `name`.
    pub async fn list(&self, name: Option<&str>) -> AppResult<Vec<Reservation>> {
        match name {
            Some(name) => self.repository.find_by_name(name).await,
            None => self.repository.find_all().await,
        }
    }

    pub async fn get(&self, id: u64) -> AppResult<Reservation> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reservation {id} does not exist")))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: u64) -> AppResult<()> {
        if self.repository.delete_by_id(id).await? {
            info!("Reservation deleted");
            Ok(())
        } else {
            Err(AppError::NotFound(format!("reservation {id} does not exist")))
        }
    }

    /// Remove every reservation.
    pub async fn delete_all(&self) -> AppResult<()> {
        self.repository.delete_all().await
    }

    pub async fn count(&self) -> AppResult<usize> {
        self.repository.count().await
    }
}
