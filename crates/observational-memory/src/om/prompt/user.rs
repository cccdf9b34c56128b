use crate::om::reflector_compression_guidance;

use super::{OmObserverPromptInput, OmReflectorPromptInput};

const SECTION_RULE: &str = "\n\n---\n\n";
const OBSERVER_TASK: &str = "Write new observations for the messages above. Stay factual and brief, and do not duplicate previous observations.";
const OBSERVER_TASK_NO_HINTS: &str = "Only output <observations>. Leave out <current-task> and <suggested-response>; a later batch provides them.";
const EXISTING_NOTE: &str =
    "These observations already exist. Do not repeat them; new observations are appended after them.";
const REFLECTOR_TASK: &str = "Rewrite these observations into a shorter, better organized memory. Your output replaces them entirely.";

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Markdown sections separated by horizontal rules, in the order the
/// observer reads them: prior memory, new messages, guidance, task.
pub fn build_observer_user_prompt(input: OmObserverPromptInput<'_>) -> String {
    let mut sections = Vec::with_capacity(5);
    if let Some(existing) = non_blank(input.existing_observations) {
        sections.push(format!("## Previous Observations\n\n{existing}"));
        sections.push(EXISTING_NOTE.to_string());
    }

    let history = match input.message_history.trim() {
        "" => "No messages provided.",
        history => history,
    };
    sections.push(format!("## New Messages\n\n{history}"));

    if let Some(extra) = non_blank(input.extra_instructions) {
        sections.push(format!("## Additional Guidance\n\n{extra}"));
    }

    let mut task = format!("## Your Task\n\n{OBSERVER_TASK}");
    if input.skip_continuation_hints {
        task.push_str("\n\n");
        task.push_str(OBSERVER_TASK_NO_HINTS);
    }
    sections.push(task);

    sections.join(SECTION_RULE)
}

pub fn build_reflector_user_prompt(input: OmReflectorPromptInput<'_>) -> String {
    let mut parts = vec![format!(
        "## OBSERVATIONS TO CONDENSE\n\n{}{SECTION_RULE}{REFLECTOR_TASK}",
        input.observations.trim()
    )];
    if let Some(target) = input.target_tokens.filter(|target| *target > 0) {
        parts.push(format!("Keep the result well under roughly {target} tokens."));
    }
    if let Some(extra) = non_blank(input.extra_instructions) {
        parts.push(format!("## SPECIFIC GUIDANCE\n\n{extra}"));
    }
    let guidance = reflector_compression_guidance(input.compression_level);
    if !guidance.is_empty() {
        parts.push(guidance.to_string());
    }
    parts.join("\n\n")
}
