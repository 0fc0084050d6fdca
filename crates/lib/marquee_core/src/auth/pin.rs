//! Secondary-factor PIN checks.
//!
//! PINs are compared as exact strings after trimming both sides.

use super::AuthError;

/// Number of digits in a PIN.
pub const PIN_LENGTH: usize = 4;

/// True when the supplied PIN equals the stored one after trimming.
pub fn pin_matches(stored: &str, supplied: &str) -> bool {
    let stored = stored.trim();
    !stored.is_empty() && stored == supplied.trim()
}

/// Canonical form of a PIN being assigned to an account.
pub fn validate_pin_format(pin: &str) -> Result<String, AuthError> {
    let pin = pin.trim();
    if pin.len() != PIN_LENGTH || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::InvalidPin);
    }
    Ok(pin.to_string())
}
