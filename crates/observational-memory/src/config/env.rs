use crate::error::{OmError, Result};
use crate::om::BufferTokensInput;

#[must_use]
pub(super) fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

#[must_use]
pub(super) fn parse_env_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|value| value.trim().to_ascii_lowercase()),
        Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on")
    )
}

pub(super) fn parse_env_u32_optional(raw: Option<&str>, env_name: &str) -> Result<Option<u32>> {
    let Some(trimmed) = non_empty(raw) else {
        return Ok(None);
    };
    let parsed = trimmed.parse::<u32>().map_err(|_| {
        OmError::Validation(format!(
            "{env_name} must be a positive integer, got: {trimmed}"
        ))
    })?;
    if parsed == 0 {
        return Err(OmError::Validation(format!(
            "{env_name} must be > 0, got: {trimmed}"
        )));
    }
    Ok(Some(parsed))
}

pub(super) fn parse_env_u64_optional(raw: Option<&str>, env_name: &str) -> Result<Option<u64>> {
    let Some(trimmed) = non_empty(raw) else {
        return Ok(None);
    };
    match trimmed.parse::<u64>() {
        Ok(0) => Err(OmError::Validation(format!(
            "{env_name} must be > 0, got: {trimmed}"
        ))),
        Ok(parsed) => Ok(Some(parsed)),
        Err(_) => Err(OmError::Validation(format!(
            "{env_name} must be a positive integer, got: {trimmed}"
        ))),
    }
}

pub(super) fn parse_env_u16_optional(raw: Option<&str>, env_name: &str) -> Result<Option<u16>> {
    let Some(trimmed) = non_empty(raw) else {
        return Ok(None);
    };
    trimmed.parse::<u16>().map(Some).map_err(|_| {
        OmError::Validation(format!("{env_name} must be an integer, got: {trimmed}"))
    })
}

pub(super) fn parse_env_f32_optional(raw: Option<&str>, env_name: &str) -> Result<Option<f32>> {
    let Some(trimmed) = non_empty(raw) else {
        return Ok(None);
    };
    let parsed = trimmed.parse::<f32>().map_err(|_| {
        OmError::Validation(format!("{env_name} must be a float, got: {trimmed}"))
    })?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(OmError::Validation(format!(
            "{env_name} must be > 0, got: {trimmed}"
        )));
    }
    Ok(Some(parsed))
}

pub(super) fn parse_env_buffer_tokens_optional(
    raw: Option<&str>,
    env_name: &str,
) -> Result<Option<BufferTokensInput>> {
    let Some(trimmed) = non_empty(raw) else {
        return Ok(None);
    };

    let lowered = trimmed.to_ascii_lowercase();
    if matches!(
        lowered.as_str(),
        "false" | "off" | "disabled" | "none" | "no"
    ) {
        return Ok(Some(BufferTokensInput::Disabled));
    }

    if let Ok(parsed_int) = trimmed.parse::<u32>() {
        if parsed_int == 0 {
            return Ok(Some(BufferTokensInput::Disabled));
        }
        return Ok(Some(BufferTokensInput::Absolute(parsed_int)));
    }

    if let Ok(parsed_float) = trimmed.parse::<f64>() {
        if parsed_float == 0.0 {
            return Ok(Some(BufferTokensInput::Disabled));
        }
        if parsed_float.is_finite() && parsed_float > 0.0 && parsed_float < 1.0 {
            return Ok(Some(BufferTokensInput::Ratio(parsed_float)));
        }
    }

    Err(OmError::Validation(format!(
        "{env_name} must be one of: false|off|disabled|<positive-int>|<ratio(0,1)>, got: {trimmed}"
    )))
}
