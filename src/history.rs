/// Rendered in place of the transcript before anyone has spoken.
pub const EMPTY_HISTORY: &str = "No one has spoken yet.";

/// Placeholder a prompt template may use to position the transcript.
pub const HISTORY_PLACEHOLDER: &str = "{conversation_history}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub agent: String,
    pub thought: String,
    pub speech: String,
}

/// Public, append-only transcript of one match.
///
/// Thoughts are kept for the log but [`Transcript::render`] only ever
/// exposes `agent: speech` lines, so no agent sees another's (or its own)
/// private reasoning.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<Utterance>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, agent: impl Into<String>, thought: impl Into<String>, speech: impl Into<String>) {
        self.entries.push(Utterance {
            agent: agent.into(),
            thought: thought.into(),
            speech: speech.into(),
        });
    }

    pub fn entries(&self) -> &[Utterance] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Utterance> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Utterance> {
        self.entries.last()
    }

    pub fn render(&self) -> String {
        render_history(&self.entries)
    }
}

pub fn render_history(entries: &[Utterance]) -> String {
    if entries.is_empty() {
        return EMPTY_HISTORY.to_string();
    }

    entries
        .iter()
        .map(|entry| format!("{}: {}", entry.agent, entry.speech))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitutes the rendered history into a user prompt template, or appends
/// a history block when the template has no placeholder.
pub fn build_user_prompt(template: &str, history_text: &str) -> String {
    let template = template.trim_end();
    if template.contains(HISTORY_PLACEHOLDER) {
        return template.replace(HISTORY_PLACEHOLDER, history_text);
    }

    format!("{template}\n\n---\n[Current conversation history]\n{history_text}\n---\n")
}
