//! Fuzz testing for validation functions.
//!
//! Ensures that name and batch validation never panic, whatever the input,
//! including multi-byte characters, control characters and very long strings.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use reservation_demo::validation::{
    validate_batch_size,
    validate_greeting_name,
    validate_reservation_name,
};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let reservation = validate_reservation_name(s);
        let greeting = validate_greeting_name(s);

        // Every valid reservation name is also a valid greeting name
        if reservation.is_ok() {
            assert!(greeting.is_ok());
        }
    }

    if data.len() >= 8 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[..8]);
        let _ = validate_batch_size(u64::from_le_bytes(bytes) as usize);
    }
});
