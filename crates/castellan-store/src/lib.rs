//! Conversation persistence: one pretty-printed JSON document per
//! conversation under `.castellan/conversations/`, plus a `current` pointer
//! file naming the active one.
//!
//! Loading is deliberately tolerant. A missing or corrupt transcript yields
//! a fresh conversation instead of an error; losing history must never kill
//! a session.

use anyhow::{Context, Result};
use castellan_core::{Message, runtime_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const CURRENT_POINTER: &str = "current";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversation_id: Uuid::now_v7(),
            messages: Vec::new(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace).join("conversations");
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating transcript dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn transcript_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist the transcript and repoint `current` at it.
    pub fn save(&self, conversation: &Conversation) -> Result<()> {
        let path = self.transcript_path(conversation.conversation_id);
        fs::write(&path, serde_json::to_vec_pretty(conversation)?)
            .with_context(|| format!("writing transcript {}", path.display()))?;
        fs::write(
            self.dir.join(CURRENT_POINTER),
            conversation.conversation_id.to_string(),
        )?;
        Ok(())
    }

    pub fn load(&self, id: Uuid) -> Result<Conversation> {
        let path = self.transcript_path(id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading transcript {}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The conversation named by the `current` pointer, or a fresh one when
    /// the pointer or transcript is missing or unreadable.
    #[must_use]
    pub fn load_current(&self) -> Conversation {
        let pointer = self.dir.join(CURRENT_POINTER);
        let Ok(raw) = fs::read_to_string(pointer) else {
            return Conversation::new();
        };
        let Ok(id) = raw.trim().parse::<Uuid>() else {
            return Conversation::new();
        };
        self.load(id).unwrap_or_default()
    }

    /// Conversation ids on disk, oldest first (v7 ids sort by time).
    pub fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name).file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = stem.parse::<Uuid>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castellan_testkit::TempWorkspace;

    #[test]
    fn save_then_load_round_trips_messages() {
        let ws = TempWorkspace::new("store").expect("ws");
        let store = TranscriptStore::new(ws.root()).expect("store");
        let mut conversation = Conversation::new();
        conversation.messages.push(Message::user("hello"));
        conversation.messages.push(Message::assistant("hi there"));
        store.save(&conversation).expect("save");

        let loaded = store.load(conversation.conversation_id).expect("load");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[test]
    fn load_current_follows_pointer() {
        let ws = TempWorkspace::new("store-current").expect("ws");
        let store = TranscriptStore::new(ws.root()).expect("store");
        let mut first = Conversation::new();
        first.messages.push(Message::user("first"));
        store.save(&first).expect("save first");
        let mut second = Conversation::new();
        second.messages.push(Message::user("second"));
        store.save(&second).expect("save second");

        let current = store.load_current();
        assert_eq!(current.conversation_id, second.conversation_id);
        assert_eq!(current.messages[0].content, "second");
    }

    #[test]
    fn load_current_without_pointer_is_fresh() {
        let ws = TempWorkspace::new("store-fresh").expect("ws");
        let store = TranscriptStore::new(ws.root()).expect("store");
        let conversation = store.load_current();
        assert!(conversation.messages.is_empty());
    }

    #[test]
    fn corrupt_transcript_degrades_to_fresh() {
        let ws = TempWorkspace::new("store-corrupt").expect("ws");
        let store = TranscriptStore::new(ws.root()).expect("store");
        let conversation = Conversation::new();
        store.save(&conversation).expect("save");
        ws.write_file(
            &format!(".castellan/conversations/{}.json", conversation.conversation_id),
            "{ not json",
        )
        .expect("corrupt");
        let recovered = store.load_current();
        assert!(recovered.messages.is_empty());
        assert_ne!(recovered.conversation_id, conversation.conversation_id);
    }

    #[test]
    fn list_skips_the_pointer_file() {
        let ws = TempWorkspace::new("store-list").expect("ws");
        let store = TranscriptStore::new(ws.root()).expect("store");
        let a = Conversation::new();
        let b = Conversation::new();
        store.save(&a).expect("save a");
        store.save(&b).expect("save b");
        let ids = store.list().expect("list");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.conversation_id));
        assert!(ids.contains(&b.conversation_id));
    }
}
