mod api;
mod greeting;
mod reservation;
mod security;

pub use api::{EdgeHealthResponse, HealthResponse, StatsResponse};
pub use greeting::{GreetingRequest, GreetingResponse};
pub use reservation::{BatchReservationRequest, NewReservation, Reservation, ReservationQuery};
pub use security::{Credentials, Principal};
