use crate::om::OmScope;

const EXTRACTION_RULES: &str = r"USER STATEMENTS VS USER QUESTIONS
When the user states something about themselves, record it as a fact.
When the user asks for something, record it as a request.
Stated facts are authoritative and must survive into later memory.

CHANGES OF STATE
When new information replaces older information, say so explicitly and keep
only the current state.

TIME
Anchor observations in time. Turn relative references (yesterday, next week)
into estimated dates, and keep the time something was said apart from the time
it refers to.

KEEP THE DETAIL THAT MATTERS
- names, handles and identifiers
- numbers, quantities and units
- dates, times, durations and ordering
- places and distinguishing attributes
- preferences and constraints the user stated
- concrete technical results, tool outcomes and relevant code

Keep the user's exact wording when the wording itself carries meaning.";

const OUTPUT_SECTIONS: &str = r"Mark each observation with a priority:
- 🔴 high: facts the user stated, preferences, goals reached, critical context
- 🟡 medium: project details, things learned, tool results
- 🟢 low: minor or uncertain details

Group observations under a date line and prefix each with a 24-hour time.

<observations>
Date: Jan 5, 2026
* 🔴 (09:12) User wants answers without preamble
* 🟡 (09:14) Migrating the billing service to the new queue
</observations>

<current-task>
Primary: what the assistant is working on right now
Secondary: anything queued behind it (say 'waiting for user' when blocked)
</current-task>

<suggested-response>
A short hint for the assistant's next message.
</suggested-response>";

const WRITING_RULES: &str = r"- Be concrete enough to act on later.
- Write densely and never repeat yourself.
- Never restate observations that already exist.
- Record what each tool call did, what it returned and why it ran.
- Keep file and line references when code is involved.
- Record both what happened and what it means.";

fn scope_note(scope: OmScope) -> &'static str {
    match scope {
        OmScope::Thread => {
            "The messages come from a single conversation thread. Do not add thread identifiers or <thread> tags."
        }
        OmScope::Resource => {
            "The messages may come from several conversation threads of the same user, each wrapped in <thread id=\"...\">. Write one combined set of observations; mention a thread only when a fact is specific to it. Do not emit <thread> tags."
        }
    }
}

#[must_use]
pub fn build_observer_system_prompt(scope: OmScope, extra_instructions: Option<&str>) -> String {
    let mut prompt = format!(
        r"You are the memory of an AI assistant. The observations you write are the only record the assistant keeps of earlier turns with this user.

Extract observations that let the assistant pick up where it left off:

{EXTRACTION_RULES}

=== OUTPUT FORMAT ===

Structure the response with XML tags:

{OUTPUT_SECTIONS}

=== WRITING RULES ===

{WRITING_RULES}

=== SCOPE ===

{}

A new question or task from the user is always the priority: say so in <current-task>, and when the assistant owes the user an answer, say in <suggested-response> that it should reply before continuing other work.",
        scope_note(scope)
    );
    push_extra_instructions(&mut prompt, extra_instructions);
    prompt
}

#[must_use]
pub fn build_reflector_system_prompt(scope: OmScope, extra_instructions: Option<&str>) -> String {
    let thread_rules = match scope {
        OmScope::Thread => "",
        OmScope::Resource => {
            "\n\nThese observations span several threads of one user. Merge facts that hold across threads; keep thread attribution only for recent work that belongs to one thread."
        }
    };
    let mut prompt = format!(
        r"You are the memory of an AI assistant, acting as the reflector. Another part of the same memory, the observer, wrote the observations below using these rules:

<observer-rules>
{EXTRACTION_RULES}

{OUTPUT_SECTIONS}

{WRITING_RULES}
</observer-rules>

Your job is to reorganize and condense all of those observations into a shorter memory. Whatever you leave out is forgotten for good.

When condensing:
- keep dates and the order of events
- merge related entries when that makes them easier to find
- compress older observations harder than recent ones
- keep the detail of recent, still-relevant context
- remove redundancy without losing facts

Facts the user stated stay authoritative. A later question does not cancel an earlier statement.{thread_rules}

=== OUTPUT FORMAT ===

Respond with:
<observations>...</observations>
<current-task>...</current-task>
<suggested-response>...</suggested-response>"
    );
    push_extra_instructions(&mut prompt, extra_instructions);
    prompt
}

fn push_extra_instructions(prompt: &mut String, extra_instructions: Option<&str>) {
    if let Some(extra) = extra_instructions
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        prompt.push_str("\n\n=== ADDITIONAL INSTRUCTIONS ===\n\n");
        prompt.push_str(extra);
    }
}
