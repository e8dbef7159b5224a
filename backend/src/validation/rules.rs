//! Common validation rules shared across event payloads and request bodies.

use validator::ValidationError;

const MAX_TENANT_ID_LENGTH: usize = 64;
const MAX_PURPOSE_CODE_LENGTH: usize = 100;

/// Validates a tenant identifier.
///
/// Requirements:
/// - 1-64 characters
/// - ASCII alphanumerics, `-` and `_` only (it becomes part of partition names)
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), ValidationError> {
    if tenant_id.is_empty() || tenant_id.len() > MAX_TENANT_ID_LENGTH {
        return Err(ValidationError::new("tenant_id_invalid_length"));
    }

    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::new("tenant_id_invalid_characters"));
    }

    Ok(())
}

/// Validates a consent purpose code.
///
/// Requirements:
/// - 1-100 characters
/// - lowercase ASCII alphanumerics, `_`, `-` and `.`
pub fn validate_purpose_code(code: &str) -> Result<(), ValidationError> {
    if code.is_empty() || code.len() > MAX_PURPOSE_CODE_LENGTH {
        return Err(ValidationError::new("purpose_code_invalid_length"));
    }

    if !code
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::new("purpose_code_invalid_characters"));
    }

    Ok(())
}

/// Rejects strings that are empty after trimming.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}
