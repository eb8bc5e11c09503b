//! Value checks run once while the gateway configuration loads.
//!
//! serde already rejects unknown enum text (protocol, device type). What is
//! left here are ranges, formats and uniqueness; anything that still slips
//! through hits the SQLite CHECK constraints.

use crate::error::ValidationError;
use crate::MAX_SLAVE_ADDRESS;

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a device name.
///
/// ## Rules
/// - Must not be empty
/// - At most 100 characters
/// - No `/`, `+` or `#`: the name is embedded in MQTT topics
///
/// ## Example
/// ```rust
/// use fieldgate_core::validation::validate_device_name;
///
/// assert!(validate_device_name("inv-1").is_ok());
/// assert!(validate_device_name("").is_err());
/// assert!(validate_device_name("a/b").is_err());
/// ```
pub fn validate_device_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "device name".to_string(),
        });
    }

    if name.len() > 100 {
        return Err(ValidationError::TooLong {
            field: "device name".to_string(),
            max: 100,
        });
    }

    if name.contains(['/', '+', '#']) {
        return Err(ValidationError::InvalidFormat {
            field: "device name".to_string(),
            reason: "must not contain '/', '+' or '#'".to_string(),
        });
    }

    Ok(())
}

/// Validates a Modbus slave address (1..=247).
pub fn validate_slave_address(address: u8) -> ValidationResult<()> {
    if address == 0 || address > MAX_SLAVE_ADDRESS {
        return Err(ValidationError::OutOfRange {
            field: "slave_address".to_string(),
            min: 1,
            max: i64::from(MAX_SLAVE_ADDRESS),
        });
    }
    Ok(())
}

/// Validates an MQTT subscription pattern.
///
/// `#` may only appear as the last segment and `+` only as a whole segment.
pub fn validate_topic_pattern(pattern: &str) -> ValidationResult<()> {
    if pattern.is_empty() {
        return Err(ValidationError::Required {
            field: "topic pattern".to_string(),
        });
    }

    let segments: Vec<&str> = pattern.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        if segment.contains('#') && (*segment != "#" || !is_last) {
            return Err(ValidationError::InvalidFormat {
                field: "topic pattern".to_string(),
                reason: format!("'#' must be the final segment in '{}'", pattern),
            });
        }
        if segment.contains('+') && *segment != "+" {
            return Err(ValidationError::InvalidFormat {
                field: "topic pattern".to_string(),
                reason: format!("'+' must occupy a whole segment in '{}'", pattern),
            });
        }
    }
    Ok(())
}

/// Validates an MQTT QoS level (0, 1 or 2).
pub fn validate_qos(qos: u8) -> ValidationResult<()> {
    if qos > 2 {
        return Err(ValidationError::OutOfRange {
            field: "qos".to_string(),
            min: 0,
            max: 2,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_device_name() {
        assert!(validate_device_name("inv-1").is_ok());
        assert!(validate_device_name("Meter Main").is_ok());

        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("   ").is_err());
        assert!(validate_device_name("a+b").is_err());
        assert!(validate_device_name(&"A".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_slave_address() {
        assert!(validate_slave_address(1).is_ok());
        assert!(validate_slave_address(247).is_ok());
        assert!(validate_slave_address(0).is_err());
        assert!(validate_slave_address(248).is_err());
    }

    #[test]
    fn test_validate_topic_pattern() {
        assert!(validate_topic_pattern("a/+/c").is_ok());
        assert!(validate_topic_pattern("a/#").is_ok());
        assert!(validate_topic_pattern("#").is_ok());

        assert!(validate_topic_pattern("").is_err());
        assert!(validate_topic_pattern("a/#/c").is_err());
        assert!(validate_topic_pattern("a/b+/c").is_err());
    }

    #[test]
    fn test_validate_qos() {
        assert!(validate_qos(0).is_ok());
        assert!(validate_qos(2).is_ok());
        assert!(validate_qos(3).is_err());
    }
}
