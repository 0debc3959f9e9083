//! Photo slot vocabulary.
//!
//! A slot is a fixed photo position (front, back, label, ...). Files whose
//! name starts with one of a slot's tokens are treated as that slot's photo
//! and overwrite the previous one instead of receiving a unique name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotVocabulary {
    slots: BTreeMap<String, Vec<String>>,
}

impl Default for SlotVocabulary {
    fn default() -> Self {
        let defaults: [(&str, &[&str]); 6] = [
            ("front", &["front", "onden"]),
            ("back", &["back", "arkadan"]),
            ("left", &["left", "soldan"]),
            ("right", &["right", "sagdan"]),
            ("label", &["label", "etiket"]),
            ("general", &["general", "genel"]),
        ];
        let slots = defaults
            .iter()
            .map(|(slot, tokens)| {
                (slot.to_string(), tokens.iter().map(|t| t.to_string()).collect())
            })
            .collect();
        Self { slots }
    }
}

impl SlotVocabulary {
    pub fn new(slots: BTreeMap<String, Vec<String>>) -> Self {
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.values().all(|tokens| tokens.is_empty())
    }

    /// Slot whose token prefixes `file_name`, compared case-insensitively.
    /// When several tokens match, the longest one wins.
    pub fn match_name(&self, file_name: &str) -> Option<&str> {
        let lowered = file_name.to_lowercase();
        self.slots
            .iter()
            .flat_map(|(slot, tokens)| tokens.iter().map(move |t| (slot, t)))
            .filter(|(_, token)| !token.is_empty() && lowered.starts_with(&token.to_lowercase()))
            .max_by_key(|(_, token)| token.len())
            .map(|(slot, _)| slot.as_str())
    }
}
