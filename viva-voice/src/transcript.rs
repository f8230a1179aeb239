// Viva - Turn-by-turn transcript
//
// The protocol delivers text as delta/done pairs: incremental partial
// updates followed by one authoritative final. The transcript keeps at most
// one open (non-final) utterance per speaker; finalized entries are
// immutable.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Human => "human",
            Speaker::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<Utterance>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta to the speaker's open utterance, creating it if absent.
    pub fn append_delta(&mut self, speaker: Speaker, delta: &str) {
        match self.open_index(speaker) {
            Some(index) => self.entries[index].text.push_str(delta),
            None => self.entries.push(Utterance {
                speaker,
                text: delta.to_string(),
                is_final: false,
                at: Utc::now(),
            }),
        }
    }

    /// Finalize the speaker's open utterance with the server-authoritative
    /// text, creating one if no utterance is open. Accumulated deltas are
    /// replaced, not appended to.
    pub fn finalize(&mut self, speaker: Speaker, text: &str) {
        match self.open_index(speaker) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.text = text.to_string();
                entry.is_final = true;
            }
            None => self.entries.push(Utterance {
                speaker,
                text: text.to_string(),
                is_final: true,
                at: Utc::now(),
            }),
        }
    }

    /// Text of the speaker's open utterance, if one exists.
    pub fn open_text(&self, speaker: Speaker) -> Option<String> {
        self.open_index(speaker)
            .map(|index| self.entries[index].text.clone())
    }

    fn open_index(&self, speaker: Speaker) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|u| u.speaker == speaker && !u.is_final)
    }

    pub fn entries(&self) -> &[Utterance] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Plain-text rendering, one "speaker: text" line per utterance, used as
    /// agent context.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry.speaker.as_str());
            out.push_str(": ");
            out.push_str(&entry.text);
            out.push('\n');
        }
        out
    }
}

/// Phrases that signal the assistant is winding the conversation down.
pub const CLOSING_PHRASES: &[&str] = &[
    "thank you for sharing",
    "take care",
    "wrap up our conversation",
    "this has been a wonderful conversation",
    "until next time",
];

/// Case-insensitive scan of a finalized utterance for closing intent.
pub fn contains_closing_phrase(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CLOSING_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}
