//! Per-session state.
//!
//! A session owns one index collection, the documents ingested during this
//! process, and the conversation history. The workspace mutex serializes
//! ingestion and queries on one session; different sessions run concurrently.

use crate::error::SessionError;
use crate::index::EmbeddingIndex;
use crate::models::{Document, HistoryEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Empty,
    Ingesting,
    Ready,
    Querying,
    Cleared,
}

#[derive(Debug, Default)]
pub struct Workspace {
    /// Documents parsed by this process, by document id.
    pub documents: BTreeMap<String, Document>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    index: Arc<EmbeddingIndex>,
    state: RwLock<SessionState>,
    workspace: Mutex<Workspace>,
}

impl Session {
    pub fn new(id: impl Into<String>, index: Arc<EmbeddingIndex>, initial: SessionState) -> Self {
        Self {
            id: id.into(),
            index,
            state: RwLock::new(initial),
            workspace: Mutex::new(Workspace::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn state(&self) -> SessionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: SessionState) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Waits for any in-flight ingestion or query on this session.
    pub async fn lock(&self) -> MutexGuard<'_, Workspace> {
        self.workspace.lock().await
    }

    /// Moves into a busy state. The returned guard puts the session back into
    /// its previous state when dropped, unless [`Transition::complete`] named
    /// another one, so a failed step never leaves the session busy.
    pub fn enter(&self, busy: SessionState) -> Result<Transition<'_>, SessionError> {
        let previous = self.state();
        if previous == SessionState::Cleared {
            return Err(SessionError::Cleared(self.id.clone()));
        }
        self.set_state(busy);
        Ok(Transition {
            session: self,
            restore: previous,
        })
    }

    pub(crate) fn mark_cleared(&self) {
        self.set_state(SessionState::Cleared);
    }
}

#[must_use]
pub struct Transition<'a> {
    session: &'a Session,
    restore: SessionState,
}

impl Transition<'_> {
    pub fn complete(mut self, next: SessionState) {
        self.restore = next;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.session.state() != SessionState::Cleared {
            self.session.set_state(self.restore);
        }
    }
}
