use crate::error::{AppError, AppResult};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for reservation and greeting names, in characters.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum number of names accepted by one batch create.
///
/// The whole batch is validated and inserted under a single lock, so keep
/// it bounded.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Checks shared by every kind of name: non-blank, bounded, printable.
fn validate_name_common(name: &str, what: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::BadRequest(format!("the {what} must not be empty")));
    }

    let length = name.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "the {what} cannot exceed {MAX_NAME_LENGTH} characters (got {length})"
        )));
    }

    if let Some(pos) = name.chars().position(|c| c.is_control()) {
        return Err(AppError::BadRequest(format!(
            "the {what} contains invalid control character at position {pos}"
        )));
    }

    Ok(())
}

/// Validate a reservation name.
///
/// Rules:
/// - Must not be empty or blank
/// - At most 255 characters, no control characters
/// - Must start with an uppercase letter
pub fn validate_reservation_name(name: &str) -> AppResult<()> {
    validate_name_common(name, "name")?;

    if !name.chars().next().is_some_and(char::is_uppercase) {
        return Err(AppError::BadRequest(
            "the first letter must be a capital letter".to_string(),
        ));
    }

    Ok(())
}

/// Validate the name a greeting stream is requested for.
///
/// Greetings are friendlier than reservations: any printable name works.
pub fn validate_greeting_name(name: &str) -> AppResult<()> {
    validate_name_common(name, "name")
}

/// Validate the size of a batch create request.
pub fn validate_batch_size(len: usize) -> AppResult<()> {
    if len == 0 {
        return Err(AppError::BadRequest(
            "the batch must contain at least one name".to_string(),
        ));
    }

    if len > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "the batch cannot contain more than {MAX_BATCH_SIZE} names (got {len})"
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_reservation_names() {
        assert!(validate_reservation_name("Josh").is_ok());
        assert!(validate_reservation_name("Madhura").is_ok());
        assert!(validate_reservation_name("A").is_ok());
        assert!(validate_reservation_name("Élodie").is_ok());
        assert!(validate_reservation_name("Mary Ann").is_ok());
    }

    #[test]
    fn test_empty_reservation_name() {
        let result = validate_reservation_name("");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("the name must not be empty")
        );
    }

    #[test]
    fn test_blank_reservation_name() {
        let result = validate_reservation_name("   ");
        assert!(result.unwrap_err().to_string().contains("must not be empty"));
    }

    #[test]
    fn test_lowercase_reservation_name() {
        let result = validate_reservation_name("josh");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("the first letter must be a capital letter")
        );
    }

    #[test]
    fn test_reservation_name_starting_with_digit() {
        let result = validate_reservation_name("1Josh");
        assert!(result.unwrap_err().to_string().contains("capital letter"));
    }

    #[test]
    fn test_reservation_name_too_long() {
        let long_name = format!("J{}", "a".repeat(255));
        let result = validate_reservation_name(&long_name);
        assert!(result.unwrap_err().to_string().contains("cannot exceed"));

        let max_name = format!("J{}", "a".repeat(254));
        assert!(validate_reservation_name(&max_name).is_ok());
    }

    #[test]
    fn test_reservation_name_control_characters() {
        let result = validate_reservation_name("Josh\nLong");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("control character")
        );
    }

    #[test]
    fn test_greeting_names() {
        assert!(validate_greeting_name("Jane").is_ok());
        assert!(validate_greeting_name("jane").is_ok());
        assert!(validate_greeting_name("").is_err());
        assert!(validate_greeting_name("ja\tne").is_err());
    }

    #[test]
    fn test_batch_size() {
        assert!(validate_batch_size(1).is_ok());
        assert!(validate_batch_size(MAX_BATCH_SIZE).is_ok());
        assert!(validate_batch_size(0).is_err());
        assert!(
            validate_batch_size(MAX_BATCH_SIZE + 1)
                .unwrap_err()
                .to_string()
                .contains("more than 1000")
        );
    }
}
