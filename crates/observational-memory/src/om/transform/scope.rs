use crate::om::model::OmScope;

use super::OmTransformError;

/// Storage key of a scope, `<scope>:<id>` with the identifier trimmed.
///
/// Only the identifier that matches `scope` is consulted; the other one is
/// ignored so callers can pass a full binding through unchanged.
pub fn build_scope_key(
    scope: OmScope,
    thread_id: Option<&str>,
    resource_id: Option<&str>,
) -> Result<String, OmTransformError> {
    let (field, raw) = match scope {
        OmScope::Thread => ("thread_id", thread_id),
        OmScope::Resource => ("resource_id", resource_id),
    };
    let id = raw
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(OmTransformError::MissingScopeIdentifier(field))?;
    Ok(format!("{}:{id}", scope.as_str()))
}
