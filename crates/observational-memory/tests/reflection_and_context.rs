mod support;

use std::sync::Arc;

use observational_memory::events::{CycleKind, OmEvent};
use observational_memory::memory::{BufferStatus, ObservationalMemory};
use observational_memory::om::{
    ObservationConfigInput, OmConfigInput, OmOriginType, OmScopeBinding, ReflectionConfigInput,
};
use observational_memory::store::{InMemoryOmStore, OmStore, SqliteOmStore};

use support::{
    CharTokens, EventLog, ScriptedModel, init_tracing, observations_reply, sized_message,
    thresholds, ts,
};

fn thread(id: &str) -> OmScopeBinding {
    OmScopeBinding::thread(id).expect("binding")
}

fn fact_lines(label: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|index| format!("- {label} fact {index:02} {}", "z".repeat(44)))
        .collect()
}

fn reply_with(lines: &[String]) -> String {
    observations_reply(&lines.iter().map(String::as_str).collect::<Vec<_>>())
}

#[tokio::test]
async fn reaching_observation_tokens_runs_one_shrinking_reflection() {
    init_tracing();
    let observer = ScriptedModel::with_replies([Ok(reply_with(&fact_lines("early", 100)))]);
    let reflector = ScriptedModel::with_replies([Ok(observations_reply(&["- condensed facts"]))]);
    let log = EventLog::default();
    let memory = ObservationalMemory::builder()
        .model(observer.clone())
        .reflector_model(reflector.clone())
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 5_000))
        .listener(log.listener())
        .build()
        .expect("build");
    let binding = thread("t-reflect");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(observer.calls(), 1);
    assert_eq!(reflector.calls(), 1);
    assert_eq!(log.count("reflection_started"), 1);
    assert_eq!(log.count("reflection_ended"), 1);
    let (before, after) = log
        .events()
        .into_iter()
        .find_map(|event| match event {
            OmEvent::ReflectionEnded {
                observation_tokens_before,
                observation_tokens_after,
                ..
            } => Some((observation_tokens_before, observation_tokens_after)),
            _ => None,
        })
        .expect("reflection ended");
    assert!(before >= 5_000);
    assert!(after < before);

    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.active_observations, "- condensed facts");
    assert_eq!(record.observation_token_count, after);
    assert_eq!(record.generation_count, 1);
    assert_eq!(record.origin_type, OmOriginType::Reflection);
    assert_eq!(record.reflector_trigger_count_total, 1);
    assert!(!record.is_reflecting);
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.generation_count, 1);
    assert_eq!(status.step_number, 2);
}

#[tokio::test]
async fn reflection_that_never_shrinks_leaves_observations_untouched() {
    let lines = fact_lines("sticky", 100);
    let observer = ScriptedModel::with_replies([Ok(reply_with(&lines))]);
    let bloated = {
        let mut longer = lines.clone();
        longer.push("- and one more thing".to_string());
        reply_with(&longer)
    };
    let reflector = ScriptedModel::with_replies([
        Ok(bloated.clone()),
        Ok(bloated.clone()),
        Ok(bloated),
    ]);
    let log = EventLog::default();
    let memory = ObservationalMemory::builder()
        .model(observer)
        .reflector_model(reflector.clone())
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 5_000))
        .listener(log.listener())
        .build()
        .expect("build");
    let binding = thread("t-no-shrink");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(reflector.calls(), 3);
    assert_eq!(log.count("reflection_failed"), 1);
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.active_observations, lines.join("\n"));
    assert_eq!(record.generation_count, 0);
    assert!(!record.is_reflecting);
    let failure = memory
        .get_status(&binding)
        .await
        .expect("status")
        .last_failure
        .expect("failure");
    assert_eq!(failure.kind, CycleKind::Reflection);
}

#[tokio::test]
async fn buffered_reflection_activates_without_another_model_call() {
    let early = fact_lines("early", 10);
    let later = fact_lines("later", 10);
    let observer = ScriptedModel::with_replies([Ok(reply_with(&early)), Ok(reply_with(&later))]);
    let reflector =
        ScriptedModel::with_replies([Ok(observations_reply(&["- condensed early facts"]))]);
    let log = EventLog::default();
    let config = OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(1_000),
            ..ObservationConfigInput::default()
        },
        reflection: ReflectionConfigInput {
            observation_tokens: Some(1_000),
            buffer_activation: Some(0.5),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    };
    let memory = ObservationalMemory::builder()
        .model(observer)
        .reflector_model(reflector.clone())
        .token_counter(Arc::new(CharTokens))
        .config(config)
        .listener(log.listener())
        .build()
        .expect("build");
    let binding = thread("t-buffered-reflection");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(reflector.calls(), 1);
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.buffered.reflection.status, BufferStatus::Ready);
    assert_eq!(status.generation_count, 0);
    assert_eq!(
        memory.get_observations(&binding).await.expect("text"),
        early.join("\n")
    );

    memory
        .observe(&binding, &[sized_message("m2", 2, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    assert_eq!(reflector.calls(), 1);
    assert!(log.events().iter().any(|event| matches!(
        event,
        OmEvent::Activation {
            kind: CycleKind::Reflection,
            ..
        }
    )));
    let record = memory.record(&binding).await.expect("record").expect("exists");
    assert_eq!(record.generation_count, 1);
    assert!(record.active_observations.starts_with("- condensed early facts\n\n"));
    assert!(record.active_observations.contains(&early[8]));
    assert!(!record.active_observations.contains(&early[7]));
    assert!(record.active_observations.ends_with(&later[9]));
    let status = memory.get_status(&binding).await.expect("status");
    assert_eq!(status.buffered.reflection.status, BufferStatus::Empty);
}

#[tokio::test]
async fn assembled_context_never_resends_observed_messages() {
    let memory = ObservationalMemory::builder()
        .model(ScriptedModel::echo())
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 100_000))
        .build()
        .expect("build");
    let binding = thread("t-context");
    let assembler = memory.context_assembler();

    let fresh = assembler.assemble(&binding).await.expect("assemble");
    assert!(fresh.is_empty());

    memory
        .observe(&binding, &[sized_message("m1", 10, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");
    memory
        .observe(
            &binding,
            &[sized_message("late", 5, 20), sized_message("m2", 20, 20)],
        )
        .await
        .expect("observe");

    let context = assembler.assemble(&binding).await.expect("assemble");
    let block = context.system_block.expect("system block");
    assert!(block.starts_with("<observational-memory>"));
    assert!(block.contains("- note 1"));
    assert_eq!(context.last_observed_at, Some(ts(10)));
    let ids = context
        .messages
        .iter()
        .map(|message| message.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["m2"]);

    let history = [
        sized_message("m1", 10, 1_100),
        sized_message("late", 5, 20),
        sized_message("m2", 20, 20),
    ];
    let from_history = assembler
        .assemble_from(&binding, &history)
        .await
        .expect("assemble");
    assert!(
        from_history
            .messages
            .iter()
            .all(|message| Some(message.created_at) > from_history.last_observed_at)
    );
    assert_eq!(from_history.messages.len(), 1);
}

#[tokio::test]
async fn hint_formatter_replaces_the_default_block() {
    let memory = ObservationalMemory::builder()
        .model(ScriptedModel::with_replies([Ok(observations_reply(&[
            "- first",
            "- second",
            "- third",
        ]))]))
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 100_000))
        .formatter(Arc::new(
            observational_memory::context::HintObservationFormatter::new(2, 64),
        ))
        .build()
        .expect("build");
    let binding = thread("t-hint");

    memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("observe");
    memory.settle(&binding).await.expect("settle");

    let block = memory
        .get_system_prompt_block(&binding)
        .await
        .expect("block");
    assert_eq!(block.as_deref(), Some("om: - second - third"));
}

#[tokio::test]
async fn sqlite_memory_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("memory").join("om.sqlite3");
    let binding = thread("t-durable");

    {
        let memory = ObservationalMemory::builder()
            .model(ScriptedModel::echo())
            .store(Arc::new(SqliteOmStore::open(&path).expect("open")))
            .token_counter(Arc::new(CharTokens))
            .config(thresholds(1_000, 100_000))
            .build()
            .expect("build");
        memory
            .observe(&binding, &[sized_message("m1", 1, 1_100)])
            .await
            .expect("observe");
        memory.settle(&binding).await.expect("settle");
        memory
            .observe(&binding, &[sized_message("m2", 2, 50)])
            .await
            .expect("observe");
        memory.settle(&binding).await.expect("settle");
        memory.shutdown().await.expect("shutdown");
    }

    let model = ScriptedModel::echo();
    let store = Arc::new(SqliteOmStore::open(&path).expect("reopen"));
    let memory = ObservationalMemory::builder()
        .model(model.clone())
        .store(store.clone())
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 100_000))
        .build()
        .expect("build");

    assert_eq!(
        memory.get_observations(&binding).await.expect("text"),
        "- note 1"
    );
    let status = memory
        .observe(&binding, &[sized_message("m1", 1, 1_100)])
        .await
        .expect("resubmit");
    assert_eq!(status.last_observed_at, Some(ts(1)));
    assert_eq!(status.active.messages.tokens, 50);
    let pending = store
        .list_unobserved_messages(&binding.scope_key, status.last_observed_at)
        .await
        .expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "m2");
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn thread_and_resource_scopes_keep_separate_records() {
    let store = Arc::new(InMemoryOmStore::new());
    let memory = ObservationalMemory::builder()
        .model(ScriptedModel::echo())
        .store(store.clone())
        .token_counter(Arc::new(CharTokens))
        .config(thresholds(1_000, 100_000))
        .build()
        .expect("build");
    let thread_scope = thread("shared");
    let resource_scope = OmScopeBinding::resource("shared").expect("binding");

    memory
        .observe(&thread_scope, &[sized_message("m1", 1, 100)])
        .await
        .expect("thread");
    memory
        .observe(&resource_scope, &[sized_message("m1", 1, 300).with_thread("shared")])
        .await
        .expect("resource");

    let thread_record = store
        .get_record(&thread_scope.scope_key)
        .await
        .expect("get")
        .expect("thread record");
    let resource_record = store
        .get_record(&resource_scope.scope_key)
        .await
        .expect("get")
        .expect("resource record");
    assert_ne!(thread_record.id, resource_record.id);
    assert_eq!(thread_record.pending_message_tokens, 100);
    assert_eq!(resource_record.pending_message_tokens, 300);
}
