use serde::{Deserialize, Serialize};

/// A stored reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Repository-assigned identifier (monotonic, starts at 1)
    pub id: u64,
    /// Name the reservation is held under
    pub name: String,
}

/// Request body for creating a single reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub name: String,
}

impl NewReservation {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Request body for creating several reservations at once.
///
/// Either every name is stored or none is.
#[derive(Debug, Deserialize)]
pub struct BatchReservationRequest {
    pub names: Vec<String>,
}

/// Query string filter for listing reservations.
#[derive(Debug, Default, Deserialize)]
pub struct ReservationQuery {
    /// Exact name match
    #[serde(default)]
    pub name: Option<String>,
}
