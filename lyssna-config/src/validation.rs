//! Custom validation functions shared by config sections.

use validator::ValidationError;

/// Validate that a buffer size is a power of two.
pub fn validate_power_of_two(value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}
