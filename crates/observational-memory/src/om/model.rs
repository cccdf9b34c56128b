use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transform::{OmTransformError, build_scope_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmScope {
    Thread,
    Resource,
}

impl OmScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Resource => "resource",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "thread" => Some(Self::Thread),
            "resource" => Some(Self::Resource),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmOriginType {
    Initial,
    Reflection,
}

impl OmOriginType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Reflection => "reflection",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initial" => Some(Self::Initial),
            "reflection" => Some(Self::Reflection),
            _ => None,
        }
    }
}

/// Identifies the memory scope a call operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OmScopeBinding {
    pub scope: OmScope,
    pub scope_key: String,
    pub thread_id: Option<String>,
    pub resource_id: Option<String>,
}

impl OmScopeBinding {
    pub fn thread(thread_id: &str) -> Result<Self, OmTransformError> {
        let scope_key = build_scope_key(OmScope::Thread, Some(thread_id), None)?;
        Ok(Self {
            scope: OmScope::Thread,
            scope_key,
            thread_id: Some(thread_id.trim().to_string()),
            resource_id: None,
        })
    }

    pub fn resource(resource_id: &str) -> Result<Self, OmTransformError> {
        let scope_key = build_scope_key(OmScope::Resource, None, Some(resource_id))?;
        Ok(Self {
            scope: OmScope::Resource,
            scope_key,
            thread_id: None,
            resource_id: Some(resource_id.trim().to_string()),
        })
    }
}

/// A conversation message as seen by the memory engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmMessage {
    pub id: String,
    pub role: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_thread_id: Option<String>,
}

impl OmMessage {
    pub fn new(
        id: impl Into<String>,
        role: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            text: text.into(),
            created_at,
            source_thread_id: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.source_thread_id = Some(thread_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmRecord {
    pub id: String,
    pub scope: OmScope,
    pub scope_key: String,
    pub thread_id: Option<String>,
    pub resource_id: Option<String>,
    pub generation_count: u32,
    pub origin_type: OmOriginType,
    pub active_observations: String,
    pub observation_token_count: u32,
    pub pending_message_tokens: u32,
    pub last_observed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    #[serde(default)]
    pub last_observed_message_ids: Vec<String>,
    /// Messages at or before the cutoff that arrived while the cycle which
    /// moved the cutoff past them was running. The next cycle folds them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carried_messages: Vec<OmMessage>,
    #[serde(default)]
    pub observer_trigger_count_total: u32,
    #[serde(default)]
    pub reflector_trigger_count_total: u32,
    pub is_observing: bool,
    pub is_reflecting: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OmRecord {
    #[must_use]
    pub fn new(binding: &OmScopeBinding, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope: binding.scope,
            scope_key: binding.scope_key.clone(),
            thread_id: binding.thread_id.clone(),
            resource_id: binding.resource_id.clone(),
            generation_count: 0,
            origin_type: OmOriginType::Initial,
            active_observations: String::new(),
            observation_token_count: 0,
            pending_message_tokens: 0,
            last_observed_at: None,
            current_task: None,
            suggested_response: None,
            last_observed_message_ids: Vec::new(),
            carried_messages: Vec::new(),
            observer_trigger_count_total: 0,
            reflector_trigger_count_total: 0,
            is_observing: false,
            is_reflecting: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn has_stale_flags(&self) -> bool {
        self.is_observing || self.is_reflecting
    }
}

/// Observation text pre-computed by buffering for the window
/// `(observed_after, last_observed_at]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmObservationChunk {
    pub id: String,
    pub seq: u32,
    pub cycle_id: String,
    pub observations: String,
    pub token_count: u32,
    pub message_tokens: u32,
    pub message_ids: Vec<String>,
    pub observed_after: Option<DateTime<Utc>>,
    pub last_observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    pub created_at: DateTime<Utc>,
}
