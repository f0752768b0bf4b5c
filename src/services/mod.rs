//! Business services.
//!
//! Service side: [`GreetingService`], [`ReservationService`],
//! [`SampleDataInitializer`] and the shared [`UserStore`].
//! Edge side: [`ReservationClient`], [`GreetingsClient`] and the startup checks.

pub mod greeting;
pub mod greetings_client;
pub mod startup_checks;
pub mod reservation;
pub mod reservation_client;
pub mod sample_data;
pub mod users;

pub use greeting::{GreetingService, GreetingStream, greeting_message};
pub use greetings_client::GreetingsClient;
pub use startup_checks::run_startup_checks;
pub use reservation::ReservationService;
pub use reservation_client::{FALLBACK_NAMES, ReservationClient};
pub use sample_data::SampleDataInitializer;
pub use users::UserStore;
