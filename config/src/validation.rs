//! # Configuration Validation
//!
//! Validates fixture configuration with the `validator` crate and folds the
//! result into a single `FixtureError::Configuration`.

use crate::config::{FixtureConfig, HandleKind, ImageRef};
use errors::FixtureError;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_POOL_SIZE: u32 = 100;

/// Validate a fixture configuration.
///
/// ## Validation Rules
/// - `username`, `database`: 1-63 characters (PostgreSQL identifier limit)
/// - `password`: non-empty, the official image refuses to start without one
/// - `timeout`: 1ms to 10 minutes
/// - pool size: 1-100
/// - image name and tag: non-empty
pub fn validate(config: &FixtureConfig) -> Result<(), FixtureError> {
    config
        .validate()
        .map_err(|errors| FixtureError::configuration(describe(&errors)))
}

pub(crate) fn validate_timeout(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("timeout_zero"));
    }
    if *value > MAX_TIMEOUT {
        return Err(ValidationError::new("timeout_too_long"));
    }
    Ok(())
}

pub(crate) fn validate_handle_kind(value: &HandleKind) -> Result<(), ValidationError> {
    match value.pool_size() {
        Some(size) if size == 0 || size > MAX_POOL_SIZE => {
            Err(ValidationError::new("pool_size_out_of_range"))
        }
        _ => Ok(())
    }
}

pub(crate) fn validate_image(value: &ImageRef) -> Result<(), ValidationError> {
    if value.name.trim().is_empty() || value.tag.trim().is_empty() {
        return Err(ValidationError::new("image_incomplete"));
    }
    Ok(())
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| {
            let codes: Vec<&str> = errs.iter().map(|e| e.code.as_ref()).collect();
            format!("{field} ({})", codes.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}
