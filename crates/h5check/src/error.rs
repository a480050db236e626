//! Errors of the front end.

use thiserror::Error;

/// An object header address given on the command line did not parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Nothing after the optional `0x` prefix.
    #[error("empty address")]
    Empty,
    /// Not a decimal or `0x`-prefixed hexadecimal number.
    #[error("invalid address {0:?}: expected a decimal or 0x-prefixed hexadecimal number")]
    Invalid(String),
}

/// Parse an address in decimal or `0x`/`0X` hexadecimal.
pub fn parse_address(text: &str) -> Result<u64, AddressError> {
    let text = text.trim();
    let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };
    if digits.is_empty() {
        return Err(AddressError::Empty);
    }
    u64::from_str_radix(digits, radix).map_err(|_| AddressError::Invalid(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_and_hex() {
        assert_eq!(parse_address("800"), Ok(800));
        assert_eq!(parse_address("0x320"), Ok(800));
        assert_eq!(parse_address("0X320"), Ok(800));
        assert_eq!(parse_address(" 96 "), Ok(96));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_address("0x"), Err(AddressError::Empty));
        assert!(matches!(parse_address("12ab"), Err(AddressError::Invalid(_))));
        assert!(matches!(parse_address("-4"), Err(AddressError::Invalid(_))));
    }
}
