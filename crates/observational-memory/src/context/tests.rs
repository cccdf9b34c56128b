use chrono::TimeZone;

use super::*;

fn record_with(observations: &str) -> OmRecord {
    let binding = OmScopeBinding::thread("t-1").expect("binding");
    let mut record = OmRecord::new(&binding, Utc::now());
    record.active_observations = observations.to_string();
    record
}

#[test]
fn xml_block_escapes_and_includes_hints() {
    let mut record = record_with("- user prefers <b>bold</b> & short answers");
    record.current_task = Some("draft the release notes".to_string());
    record.suggested_response = Some("  ".to_string());

    let block = XmlObservationFormatter.format(&record).expect("block");
    assert_eq!(
        block,
        "<observational-memory>\n<observations>\n- user prefers &lt;b&gt;bold&lt;/b&gt; &amp; short answers\n</observations>\n<current-task>draft the release notes</current-task>\n</observational-memory>"
    );
}

#[test]
fn xml_block_is_absent_without_observations() {
    let mut record = record_with(" \n ");
    record.current_task = Some("something".to_string());
    assert!(XmlObservationFormatter.format(&record).is_none());
}

#[test]
fn hint_keeps_the_newest_lines_under_prefix() {
    let hint = bounded_observation_hint("a\nb\nc", 2, 32).expect("hint");
    assert_eq!(hint, "om: b c");
}

#[test]
fn hint_compacts_whitespace_and_respects_char_budget() {
    let hint = bounded_observation_hint("a   b\n\n  c   d", 2, 6).expect("hint");
    assert_eq!(hint, "om: a b c");
}

#[test]
fn hint_is_absent_for_zero_limits_or_blank_text() {
    assert!(bounded_observation_hint("a", 0, 10).is_none());
    assert!(bounded_observation_hint("a", 2, 0).is_none());
    assert!(bounded_observation_hint(" \n ", 2, 10).is_none());
    assert!(
        HintObservationFormatter::new(3, 80)
            .format(&record_with(""))
            .is_none()
    );
}

#[test]
fn assembled_context_reports_emptiness() {
    assert!(AssembledContext::default().is_empty());
    let at = Utc
        .with_ymd_and_hms(2026, 2, 9, 10, 0, 0)
        .single()
        .expect("valid timestamp");
    let context = AssembledContext {
        system_block: None,
        messages: vec![OmMessage::new("m1", "user", "hi", at)],
        last_observed_at: None,
    };
    assert!(!context.is_empty());
}
