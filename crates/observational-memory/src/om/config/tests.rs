use serde_json::json;

use super::*;
use crate::om::OmScope;

#[test]
fn defaults_match_expected_thresholds_and_async_defaults() {
    let resolved = resolve_om_config(OmConfigInput::default()).expect("resolve");
    assert_eq!(resolved.observation.message_tokens_base, 30_000);
    assert_eq!(resolved.observation.max_tokens_per_batch, 10_000);
    assert_eq!(resolved.reflection.observation_tokens, 40_000);
    assert_eq!(resolved.observation.buffer_tokens, Some(6_000));
    assert_eq!(resolved.observation.buffer_activation, Some(0.8));
    assert_eq!(resolved.observation.block_after_threshold(0), 36_000);
    assert_eq!(resolved.observation.buffer_activation_threshold(0), Some(24_000));
    assert_eq!(resolved.reflection.buffer_activation, Some(0.5));
    assert_eq!(resolved.reflection.block_after_threshold(), 48_000);
    assert_eq!(resolved.reflection.buffer_activation_threshold(), Some(20_000));
    assert!(!resolved.async_buffering_disabled);
}

#[test]
fn share_token_budget_rejects_default_async_buffering() {
    let input = OmConfigInput {
        share_token_budget: true,
        ..OmConfigInput::default()
    };
    let err = resolve_om_config(input).expect_err("must reject");
    assert_eq!(err, OmConfigError::ShareTokenBudgetRequiresAsyncDisabled);
}

#[test]
fn share_token_budget_allows_explicit_buffer_disable() {
    let input = OmConfigInput {
        share_token_budget: true,
        observation: ObservationConfigInput {
            buffer_tokens: Some(BufferTokensInput::Disabled),
            ..ObservationConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let resolved = resolve_om_config(input).expect("resolve");
    assert!(resolved.async_buffering_disabled);
    assert_eq!(resolved.observation.total_budget, Some(70_000));
    assert_eq!(resolved.observation.buffer_tokens, None);
    assert_eq!(resolved.observation.buffer_activation, None);
    assert_eq!(resolved.observation.dynamic_threshold(10_000), 60_000);
    assert_eq!(resolved.observation.dynamic_threshold(65_000), 30_000);
}

#[test]
fn resource_scope_keeps_async_buffering_available() {
    let input = OmConfigInput::default().for_scope(OmScope::Resource);
    let resolved = resolve_om_config(input).expect("resolve");
    assert_eq!(resolved.scope, OmScope::Resource);
    assert!(!resolved.async_buffering_disabled);
    assert_eq!(resolved.observation.buffer_tokens, Some(6_000));
}

#[test]
fn disabled_buffering_drops_activation_but_keeps_block_after() {
    let input = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(1_000),
            buffer_tokens: Some(BufferTokensInput::Disabled),
            buffer_activation: Some(0.8),
            block_after: Some(1.5),
            ..ObservationConfigInput::default()
        },
        reflection: ReflectionConfigInput {
            buffer_activation: Some(0.5),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let resolved = resolve_om_config(input).expect("resolve");
    assert!(resolved.async_buffering_disabled);
    assert_eq!(resolved.observation.buffer_activation, None);
    assert_eq!(resolved.observation.buffer_activation_threshold(0), None);
    assert_eq!(resolved.reflection.buffer_activation, None);
    assert_eq!(resolved.observation.block_after_threshold(0), 1_500);
}

#[test]
fn invalid_buffer_activation_is_rejected() {
    let input = OmConfigInput {
        observation: ObservationConfigInput {
            buffer_activation: Some(0.0),
            ..ObservationConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let err = resolve_om_config(input).expect_err("must reject");
    assert_eq!(err, OmConfigError::InvalidObservationBufferActivation);

    let input = OmConfigInput {
        reflection: ReflectionConfigInput {
            buffer_activation: Some(1.5),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let err = resolve_om_config(input).expect_err("must reject");
    assert_eq!(err, OmConfigError::InvalidReflectionBufferActivation);
}

#[test]
fn observation_buffer_tokens_must_be_below_threshold() {
    let input = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(10_000),
            buffer_tokens: Some(BufferTokensInput::Absolute(10_000)),
            ..ObservationConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let err = resolve_om_config(input).expect_err("must reject");
    assert_eq!(
        err,
        OmConfigError::ObservationBufferTokensAtOrAboveThreshold
    );
}

#[test]
fn zero_thresholds_are_rejected() {
    let input = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(0),
            ..ObservationConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    assert_eq!(
        resolve_om_config(input).expect_err("must reject"),
        OmConfigError::InvalidObservationMessageTokens
    );

    let input = OmConfigInput {
        reflection: ReflectionConfigInput {
            observation_tokens: Some(0),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    assert_eq!(
        resolve_om_config(input).expect_err("must reject"),
        OmConfigError::InvalidReflectionObservationTokens
    );

    let input = OmConfigInput {
        observation: ObservationConfigInput {
            max_tokens_per_batch: Some(0),
            ..ObservationConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    assert_eq!(
        resolve_om_config(input).expect_err("must reject"),
        OmConfigError::InvalidObservationMaxTokensPerBatch
    );
}

#[test]
fn block_after_must_be_a_finite_multiplier_of_at_least_one() {
    for raw in [f32::INFINITY, f32::NAN, 0.9, -1.0] {
        let input = OmConfigInput {
            observation: ObservationConfigInput {
                block_after: Some(raw),
                ..ObservationConfigInput::default()
            },
            ..OmConfigInput::default()
        };
        let err = resolve_om_config(input).expect_err("must reject");
        assert_eq!(err, OmConfigError::InvalidObservationBlockAfter);
    }

    let input = OmConfigInput {
        reflection: ReflectionConfigInput {
            block_after: Some(0.5),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let err = resolve_om_config(input).expect_err("must reject");
    assert_eq!(err, OmConfigError::InvalidReflectionBlockAfter);
}

#[test]
fn block_after_scales_thresholds_including_large_multipliers() {
    let input = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(12_000),
            block_after: Some(1.0),
            ..ObservationConfigInput::default()
        },
        reflection: ReflectionConfigInput {
            observation_tokens: Some(20_000),
            block_after: Some(3.0),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let resolved = resolve_om_config(input).expect("resolve");
    assert_eq!(resolved.observation.block_after_threshold(0), 12_000);
    assert_eq!(resolved.reflection.block_after_threshold(), 60_000);
}

#[test]
fn buffer_tokens_input_serialization_is_explicit_and_stable() {
    assert_eq!(
        serde_json::to_value(BufferTokensInput::Disabled).expect("serialize"),
        json!({ "type": "disabled" })
    );
    assert_eq!(
        serde_json::to_value(BufferTokensInput::Absolute(10)).expect("serialize"),
        json!({ "type": "absolute", "value": 10 })
    );
    assert_eq!(
        serde_json::to_value(BufferTokensInput::Ratio(0.2)).expect("serialize"),
        json!({ "type": "ratio", "value": 0.2 })
    );

    let unknown_type = serde_json::from_value::<BufferTokensInput>(json!({
        "type": "unknown",
        "value": 1
    }));
    assert!(unknown_type.is_err());
}

#[test]
fn config_input_deserializes_partial_json() {
    let input = serde_json::from_value::<OmConfigInput>(json!({
        "scope": "resource",
        "observation": { "message_tokens": 1000 }
    }))
    .expect("deserialize");
    assert_eq!(input.scope, OmScope::Resource);
    assert!(!input.share_token_budget);
    assert_eq!(input.observation.message_tokens, Some(1_000));
    assert_eq!(input.reflection, ReflectionConfigInput::default());
}

#[test]
fn config_input_defaults_to_thread_scope() {
    let input = serde_json::from_value::<OmConfigInput>(json!({
        "reflection": { "observation_tokens": 500 }
    }))
    .expect("deserialize");
    assert_eq!(input.scope, OmScope::Thread);
    assert_eq!(input.reflection.observation_tokens, Some(500));
}
