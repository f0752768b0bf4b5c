mod edge;
mod greetings;
mod health;
mod reservations;

pub use edge::{edge_greetings, gateway, reservation_names};
pub use greetings::{sse_greetings, ws_greetings};
pub use health::{edge_health_check, edge_readiness_check, health_check, readiness_check, stats};
pub use reservations::{
    create_batch, create_reservation, delete_reservation, get_reservation, list_reservations,
};
