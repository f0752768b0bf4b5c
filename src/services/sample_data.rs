use tracing::{info, instrument};

use crate::error::AppResult;
use crate::models::Reservation;
use crate::services::ReservationService;

/// Resets the repository to a known set of reservations at startup.
pub struct SampleDataInitializer {
    service: ReservationService,
    names: Vec<String>,
}

impl SampleDataInitializer {
    pub fn new(service: ReservationService, names: Vec<String>) -> Self {
        Self { service, names }
    }

    /// Delete everything, store the sample names, and log what was stored.
    #[instrument(skip(self), fields(count = self.names.len()))]
    pub async fn run(&self) -> AppResult<Vec<Reservation>> {
        self.service.delete_all().await?;

        if self.names.is_empty() {
            info!("No sample reservations configured");
            return Ok(Vec::new());
        }

        let saved = self.service.save_all_by_name(&self.names).await?;
        for reservation in self.service.list(None).await? {
            info!(id = reservation.id, name = %reservation.name, "Sample reservation");
        }

        Ok(saved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SAMPLE_RESERVATIONS;
    use crate::repository::InMemoryReservationRepository;
    use std::sync::Arc;

    fn default_names() -> Vec<String> {
        DEFAULT_SAMPLE_RESERVATIONS
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_seed_replaces_existing_data() {
        let service = ReservationService::new(Arc::new(InMemoryReservationRepository::new()));
        service.create("Stale").await.unwrap();

        let saved = SampleDataInitializer::new(service.clone(), default_names())
            .run()
            .await
            .unwrap();

        assert_eq!(saved.len(), 8);
        let all = service.list(None).await.unwrap();
        assert_eq!(all.len(), 8);
        assert!(all.iter().all(|r| r.name != "Stale"));
        assert_eq!(all[0].name, "Josh");
    }

    #[tokio::test]
    async fn test_seed_with_invalid_name_stores_nothing() {
        let service = ReservationService::new(Arc::new(InMemoryReservationRepository::new()));

        let result = SampleDataInitializer::new(
            service.clone(),
            vec!["Josh".to_string(), "madhura".to_string()],
        )
        .run()
        .await;

        assert!(result.is_err());
        assert_eq!(service.count().await.unwrap(), 0);
    }
}
