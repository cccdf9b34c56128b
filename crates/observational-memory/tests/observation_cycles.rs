mod support;

use std::sync::Arc;
use std::time::Duration;

use observational_memory::events::{CycleKind, OmEvent};
use observational_memory::memory::{BufferStatus, CyclePhase, ObservationalMemory};
use observational_memory::model::{LanguageModel, ModelError, ModelPrompt, ModelSettings};
use observational_memory::om::{
    BufferTokensInput, ObservationConfigInput, OmConfigInput, OmScopeBinding,
    ReflectionConfigInput,
};
use observational_memory::store::InMemoryOmStore;

use support::{
    CharTokens, EventLog, GatedModel, ScriptedModel, UnavailableStore, init_tracing,
    sized_message, thresholds, ts,
};

fn memory(model: Arc<dyn LanguageModel>, config: OmConfigInput, log: &EventLog) -> ObservationalMemory {
    ObservationalMemory::builder()
        .model(model)
        .store(Arc::new(InMemoryOmStore::new()))
        .token_counter(Arc::new(CharTokens))
        .config(config)
        .listener(log.listener())
        .with_tracing()
        .build()
        .expect("build memory")
}

fn thread(id: &str) -> OmScopeBinding {
    OmScopeBinding::thread(id).expect("binding")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn one_activation_once_pending_tokens_cross_the_threshold() {
    init_tracing();
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let memory = memory(model.clone(), thresholds(1_000, 100_000), &log);
    let binding = thread("t-threshold");

    let status = memory
        .observe(&binding, &[sized_message("m1", 1, 600)])
        .await
        .expect("observe 600");
    memory.settle(&binding).await.expect("settle");
    assert_eq!(status.active.messages.tokens, 600);
    assert_eq!(model.calls(), 0);
    assert_eq!(log.count("observation_started"), 0);

    memory
        .observe(&binding, &[sized_message("m2", 2, 500)])
        .await
        .expect("observe 500");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(model.calls(), 1);
    assert_eq!(log.count("observation_started"), 1);
    assert_eq!(log.count("observation_ended"), 1);
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.active_observations, "- note 1");
    assert_eq!(record.pending_message_tokens, 0);
    assert_eq!(record.last_observed_at, Some(ts(2)));
    assert_eq!(record.last_observed_message_ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn observe_without_new_messages_leaves_the_record_alone() {
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let memory = memory(model.clone(), thresholds(1_000, 100_000), &log);
    let binding = thread("t-idempotent");
    let first = [sized_message("m1", 1, 100)];

    memory.observe(&binding, &first).await.expect("observe");
    memory.settle(&binding).await.expect("settle");
    let before = memory.record(&binding).await.expect("record").expect("exists");

    let again = memory.observe(&binding, &first).await.expect("observe again");
    let empty = memory.observe(&binding, &[]).await.expect("observe nothing");
    memory.settle(&binding).await.expect("settle");
    let after = memory.record(&binding).await.expect("record").expect("exists");

    assert_eq!(before, after);
    assert_eq!(again.active.messages.tokens, 100);
    assert_eq!(empty.active.messages.tokens, 100);
    assert_eq!(model.calls(), 0);
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn concurrent_triggers_share_a_single_observer_cycle() {
    let model = GatedModel::closed();
    let log = EventLog::default();
    let mut config = thresholds(1_000, 100_000);
    config.observation.block_after = Some(10.0);
    let memory = memory(model.clone(), config, &log);
    let binding = thread("t-single-flight");

    memory
        .observe(&binding, &[sized_message("m0", 0, 1_100)])
        .await
        .expect("first trigger");
    wait_until(|| model.in_flight() == 1).await;

    let callers = (1..=6)
        .map(|index| {
            let memory = memory.clone();
            let binding = binding.clone();
            tokio::spawn(async move {
                memory
                    .observe(&binding, &[sized_message(&format!("m{index}"), index, 400)])
                    .await
            })
        })
        .collect::<Vec<_>>();
    for caller in callers {
        caller.await.expect("join").expect("observe");
    }
    assert_eq!(model.calls(), 1);

    model.release(16);
    memory.settle(&binding).await.expect("settle");

    assert_eq!(model.max_in_flight(), 1);
    let starts = log.count("observation_started");
    assert_eq!(starts, log.count("observation_ended"));
    assert_eq!(starts, model.calls());
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert!(!record.is_observing);
}

#[tokio::test]
async fn observe_blocks_only_past_block_after() {
    let model = GatedModel::closed();
    let log = EventLog::default();
    let mut config = thresholds(1_000, 100_000);
    config.observation.block_after = Some(1.5);
    let memory = memory(model.clone(), config, &log);
    let binding = thread("t-backpressure");

    let status = tokio::time::timeout(
        Duration::from_secs(2),
        memory.observe(&binding, &[sized_message("m1", 1, 1_200)]),
    )
    .await
    .expect("1200 pending does not block")
    .expect("observe");
    assert_eq!(status.active.messages.tokens, 1_200);
    wait_until(|| model.in_flight() == 1).await;

    let blocked = {
        let memory = memory.clone();
        let binding = binding.clone();
        tokio::spawn(async move {
            memory
                .observe(&binding, &[sized_message("m2", 2, 400)])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "1600 pending must wait for the cycle");

    model.release(1);
    let status = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("unblocked after the cycle")
        .expect("join")
        .expect("observe");
    assert_eq!(status.last_observed_at, Some(ts(1)));
    assert_eq!(status.active.messages.tokens, 400);
}

#[tokio::test]
async fn message_tied_with_the_running_window_is_carried_to_the_next_cycle() {
    let model = GatedModel::closed();
    let log = EventLog::default();
    let mut config = thresholds(1_000, 100_000);
    config.observation.block_after = Some(1.5);
    let memory = memory(model.clone(), config, &log);
    let binding = thread("t-tie");

    memory
        .observe(&binding, &[sized_message("a1", 5, 1_100)])
        .await
        .expect("observe");
    wait_until(|| model.in_flight() == 1).await;
    memory
        .observe(&binding, &[sized_message("b2", 5, 50)])
        .await
        .expect("observe mid-cycle");
    model.release(1);
    memory.settle(&binding).await.expect("settle");

    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.last_observed_at, Some(ts(5)));
    let carried = record
        .carried_messages
        .iter()
        .map(|message| message.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(carried, vec!["b2"]);
    assert_eq!(record.pending_message_tokens, 50);
    assert_eq!(model.calls(), 1);

    let context = memory
        .context_assembler()
        .assemble(&binding)
        .await
        .expect("assemble");
    let ids = context
        .messages
        .iter()
        .map(|message| message.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["b2"]);

    memory
        .observe(&binding, &[sized_message("c3", 6, 1_000)])
        .await
        .expect("observe");
    model.release(1);
    memory.settle(&binding).await.expect("settle");

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].user.contains("a1:"));
    assert!(!prompts[0].user.contains("b2:"));
    assert!(prompts[1].user.contains("b2:"));
    assert!(prompts[1].user.contains("c3:"));
    assert!(!prompts[1].user.contains("a1:"));

    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert!(record.carried_messages.is_empty());
    assert_eq!(record.last_observed_at, Some(ts(6)));
    assert_eq!(record.pending_message_tokens, 0);
}

/// Panics on every call, as a buggy model adapter would.
struct PanickingModel;

#[async_trait::async_trait]
impl LanguageModel for PanickingModel {
    async fn generate(
        &self,
        _prompt: &ModelPrompt,
        _settings: &ModelSettings,
    ) -> Result<String, ModelError> {
        panic!("adapter bug");
    }
}

#[tokio::test]
async fn panicking_listener_does_not_wedge_the_scope() {
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let mut config = thresholds(1_000, 100_000);
    config.observation.block_after = Some(1.5);
    let memory = memory(model.clone(), config, &log);
    memory.add_listener(Arc::new(|event: &OmEvent| {
        if event.name().ends_with("_started") {
            panic!("listener bug");
        }
    }));
    let binding = thread("t-listener-panic");

    let status = tokio::time::timeout(
        Duration::from_secs(2),
        memory.observe(&binding, &[sized_message("m1", 1, 1_600)]),
    )
    .await
    .expect("observe returns")
    .expect("observe");
    assert_eq!(status.last_observed_at, Some(ts(1)));
    tokio::time::timeout(Duration::from_secs(2), memory.settle(&binding))
        .await
        .expect("settle returns")
        .expect("settle");
    assert_eq!(log.count("observation_ended"), 1);
}

#[tokio::test]
async fn panicking_model_releases_the_scope() {
    let log = EventLog::default();
    let mut config = thresholds(1_000, 100_000);
    config.observation.block_after = Some(1.5);
    let memory = memory(Arc::new(PanickingModel), config, &log);
    let binding = thread("t-model-panic");

    tokio::time::timeout(
        Duration::from_secs(2),
        memory.observe(&binding, &[sized_message("m1", 1, 1_600)]),
    )
    .await
    .expect("observe returns")
    .expect("observe");
    tokio::time::timeout(Duration::from_secs(2), memory.settle(&binding))
        .await
        .expect("settle returns")
        .expect("settle");
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.observer, CyclePhase::Idle);
    assert_eq!(status.last_observed_at, None);

    tokio::time::timeout(Duration::from_secs(2), memory.shutdown())
        .await
        .expect("shutdown returns")
        .expect("shutdown");
}

#[tokio::test]
async fn failed_observation_keeps_state_and_retries_the_window() {
    let model = ScriptedModel::with_replies([Err(ModelError::transient("model overloaded"))]);
    let log = EventLog::default();
    let memory = memory(model.clone(), thresholds(1_000, 100_000), &log);
    let binding = thread("t-retry");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe never fails on cycle errors");
    memory.settle(&binding).await.expect("settle");

    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.pending_message_tokens, 1_100);
    assert_eq!(record.last_observed_at, None);
    assert_eq!(record.active_observations, "");
    assert!(!record.is_observing);
    let status = memory.get_status(&binding).await.expect("status");
    let failure = status.last_failure.expect("failure recorded");
    assert_eq!(failure.kind, CycleKind::Observation);
    assert_eq!(failure.code, "MODEL_INVOCATION_FAILED");
    assert!(failure.retryable);
    assert_eq!(log.count("observation_failed"), 1);

    memory
        .observe(&binding, &[sized_message("m2", 2, 10)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].user.contains("m1:x"));
    assert!(prompts[1].user.contains("m2:x"));
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.last_observed_at, Some(ts(2)));
    assert_eq!(record.pending_message_tokens, 0);
    let status = memory.get_status(&binding).await.expect("status");
    assert!(status.last_failure.is_none());
    assert_eq!(status.observer, CyclePhase::Idle);
}

#[tokio::test]
async fn scopes_run_their_cycles_independently() {
    let model = GatedModel::closed();
    let log = EventLog::default();
    let memory = memory(model.clone(), thresholds(1_000, 100_000), &log);
    let left = thread("t-left");
    let right = OmScopeBinding::resource("r-right").expect("binding");

    let left_messages = [sized_message("l1", 1, 1_100)];
    let right_messages = [sized_message("r1", 1, 1_100).with_thread("t-9")];
    let (a, b) = tokio::join!(
        memory.observe(&left, &left_messages),
        memory.observe(&right, &right_messages),
    );
    a.expect("left");
    b.expect("right");
    wait_until(|| model.in_flight() == 2).await;

    model.release(2);
    memory.settle(&left).await.expect("settle left");
    memory.settle(&right).await.expect("settle right");

    for binding in [&left, &right] {
        let record = memory.record(binding).await.expect("record").expect("exists");
        assert_eq!(record.observer_trigger_count_total, 1);
        assert_eq!(record.last_observed_at, Some(ts(1)));
        assert!(record.active_observations.starts_with("- gated note"));
    }
}

#[tokio::test]
async fn last_observed_at_only_moves_forward() {
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let memory = memory(model, thresholds(1_000, 100_000), &log);
    let binding = thread("t-monotonic");

    for (round, second) in [(1, 10), (2, 20), (3, 30)] {
        memory
            .observe(&binding, &[sized_message(&format!("m{round}"), second, 1_050)])
            .await
            .expect("observe");
        memory
            .observe(&binding, &[sized_message(&format!("late{round}"), second - 15, 1_050)])
            .await
            .expect("late message");
        memory.settle(&binding).await.expect("settle");
    }

    let cutoffs = log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            OmEvent::ObservationEnded {
                last_observed_at, ..
            } => Some(last_observed_at),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(!cutoffs.is_empty());
    assert!(cutoffs.windows(2).all(|pair| pair[0] <= pair[1]));
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.last_observed_at, cutoffs.last().copied());
    assert_eq!(record.last_observed_at, Some(ts(30)));
}

#[tokio::test]
async fn per_call_hooks_see_the_cycles_they_scheduled() {
    let model = ScriptedModel::echo();
    let global = EventLog::default();
    let memory = memory(model, thresholds(1_000, 100_000), &global);
    let binding = thread("t-hooks");
    let hook = EventLog::default();

    memory
        .observe_with_hooks(&binding, &[sized_message("m1", 1, 1_100)], vec![hook.listener()])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");
    assert_eq!(hook.names(), vec!["observation_started", "observation_ended"]);
    assert_eq!(global.names(), hook.names());

    memory
        .observe(&binding, &[sized_message("m2", 2, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");
    assert_eq!(hook.events().len(), 2);
    assert_eq!(global.count("observation_ended"), 2);
}

#[tokio::test]
async fn subscribers_receive_events_over_broadcast() {
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let memory = memory(model, thresholds(1_000, 100_000), &log);
    let binding = thread("t-broadcast");
    let mut receiver = memory.subscribe();

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    let started = receiver.recv().await.expect("started");
    let ended = receiver.recv().await.expect("ended");
    assert_eq!(started.name(), "observation_started");
    assert_eq!(ended.name(), "observation_ended");
    assert_eq!(ended.scope_key(), binding.scope_key);
    assert_eq!(started.cycle_id(), ended.cycle_id());
}

#[tokio::test]
async fn buffered_chunks_are_reused_at_activation() {
    let model = ScriptedModel::echo();
    let log = EventLog::default();
    let config = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(1_000),
            buffer_tokens: Some(BufferTokensInput::Absolute(200)),
            buffer_activation: Some(0.5),
            ..ObservationConfigInput::default()
        },
        reflection: ReflectionConfigInput {
            observation_tokens: Some(100_000),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let memory = memory(model.clone(), config, &log);
    let binding = thread("t-buffered");

    memory
        .observe(&binding, &[sized_message("m1", 1, 600)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.buffered.observations.status, BufferStatus::Ready);
    assert_eq!(status.buffered.observations.chunks, 1);
    assert_eq!(status.last_observed_at, None);
    assert_eq!(memory.get_observations(&binding).await.expect("text"), "");

    memory
        .observe(&binding, &[sized_message("m2", 2, 300)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.buffered.observations.chunks, 2);
    assert_eq!(status.buffered.observations.input_tokens, 900);

    memory
        .observe(&binding, &[sized_message("m3", 3, 200)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(model.calls(), 3);
    let activation = log
        .events()
        .into_iter()
        .find_map(|event| match event {
            OmEvent::Activation {
                kind: CycleKind::Observation,
                chunks_activated,
                message_tokens_activated,
                ..
            } => Some((chunks_activated, message_tokens_activated)),
            _ => None,
        })
        .expect("activation event");
    assert_eq!(activation, (2, 900));
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(
        record.active_observations,
        "- note 1\n\n- note 2\n\n- note 3"
    );
    assert_eq!(record.last_observed_at, Some(ts(3)));
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.buffered.observations.status, BufferStatus::Empty);
    assert_eq!(log.count("buffering_ended"), 2);
}

#[tokio::test]
async fn unavailable_storage_fails_observe() {
    let memory = ObservationalMemory::builder()
        .model(ScriptedModel::echo())
        .store(Arc::new(UnavailableStore))
        .build()
        .expect("build");
    let err = memory
        .observe(&thread("t-down"), &[sized_message("m1", 1, 10)])
        .await
        .expect_err("storage is down");
    assert!(err.is_storage());
    assert_eq!(err.code(), "STORAGE_ERROR");
}

#[tokio::test]
async fn shutdown_waits_for_the_in_flight_cycle() {
    let model = GatedModel::closed();
    let log = EventLog::default();
    let memory = memory(model.clone(), thresholds(1_000, 100_000), &log);
    let binding = thread("t-shutdown");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    wait_until(|| model.in_flight() == 1).await;

    let stopping = {
        let memory = memory.clone();
        tokio::spawn(async move { memory.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    model.release(1);
    stopping.await.expect("join").expect("shutdown");
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.last_observed_at, Some(ts(1)));
    assert!(matches!(
        memory.observe(&binding, &[sized_message("m2", 2, 10)]).await,
        Err(observational_memory::OmError::ShuttingDown)
    ));
}
