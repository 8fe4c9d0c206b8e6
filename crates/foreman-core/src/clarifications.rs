// Clarification Registry
// Externally-answered questions that can gate steps. Scoped to a project,
// a protocol, or a single step; persisted across restarts.

use crate::error::{ForemanError, Result};
use crate::ids::IdProvider;
use crate::store::ProtocolStore;
use chrono::Utc;
use foreman_types::{Clarification, ClarificationScope, ClarificationStatus};
use std::sync::{Arc, Mutex as StdMutex};

pub fn step_scope_id(protocol_id: &str, step_index: u32) -> String {
    format!("{}/{}", protocol_id, step_index)
}

/// Does this clarification gate the given step?
fn applies_to_step(
    clarification: &Clarification,
    project_id: &str,
    protocol_id: &str,
    step_index: u32,
) -> bool {
    match clarification.scope {
        ClarificationScope::Project => clarification.scope_id == project_id,
        ClarificationScope::Protocol => clarification.scope_id == protocol_id,
        ClarificationScope::Step => {
            clarification.scope_id == step_scope_id(protocol_id, step_index)
        }
    }
}

fn applies_to_protocol(clarification: &Clarification, project_id: &str, protocol_id: &str) -> bool {
    match clarification.scope {
        ClarificationScope::Project => clarification.scope_id == project_id,
        ClarificationScope::Protocol => clarification.scope_id == protocol_id,
        ClarificationScope::Step => clarification
            .scope_id
            .starts_with(&format!("{}/", protocol_id)),
    }
}

pub struct ClarificationRegistry {
    store: Arc<ProtocolStore>,
    ids: IdProvider,
    items: StdMutex<Vec<Clarification>>,
}

impl ClarificationRegistry {
    pub fn new(store: Arc<ProtocolStore>) -> Result<Self> {
        let items = store.load_clarifications()?;
        Ok(Self {
            store,
            ids: IdProvider,
            items: StdMutex::new(items),
        })
    }

    /// Raise a clarification. Idempotent per (scope, scope_id, key): raising
    /// an already-open question returns the existing record.
    pub fn raise(
        &self,
        scope: ClarificationScope,
        scope_id: impl Into<String>,
        key: impl Into<String>,
        blocking: bool,
        question: impl Into<String>,
        options: Vec<String>,
    ) -> Result<Clarification> {
        let scope_id = scope_id.into();
        let key = key.into();
        let mut items = self.items.lock().expect("clarification registry poisoned");

        if let Some(existing) = items.iter().find(|c| {
            c.scope == scope
                && c.scope_id == scope_id
                && c.key == key
                && c.status == ClarificationStatus::Open
        }) {
            return Ok(existing.clone());
        }

        let clarification = Clarification {
            id: self.ids.new_id(),
            scope,
            scope_id,
            key,
            blocking,
            status: ClarificationStatus::Open,
            question: question.into(),
            options,
            answer: None,
            created_at: Utc::now(),
            answered_at: None,
        };
        items.push(clarification.clone());
        self.store.save_clarifications(&items)?;
        Ok(clarification)
    }

    /// Answer the open clarification with `key` that applies to the given
    /// protocol (at any scope level).
    pub fn answer(
        &self,
        project_id: &str,
        protocol_id: &str,
        key: &str,
        answer: impl Into<String>,
    ) -> Result<Clarification> {
        let mut items = self.items.lock().expect("clarification registry poisoned");
        let found = items.iter_mut().find(|c| {
            c.key == key
                && c.status == ClarificationStatus::Open
                && applies_to_protocol(c, project_id, protocol_id)
        });
        let Some(clarification) = found else {
            return Err(ForemanError::NotFound(format!(
                "open clarification '{}' for protocol {}",
                key, protocol_id
            )));
        };

        clarification.status = ClarificationStatus::Answered;
        clarification.answer = Some(answer.into());
        clarification.answered_at = Some(Utc::now());
        let answered = clarification.clone();

        self.store.save_clarifications(&items)?;
        Ok(answered)
    }

    /// Open blocking clarifications that gate one step.
    pub fn open_blockers_for_step(
        &self,
        project_id: &str,
        protocol_id: &str,
        step_index: u32,
    ) -> Vec<Clarification> {
        self.items
            .lock()
            .expect("clarification registry poisoned")
            .iter()
            .filter(|c| c.is_open_blocker())
            .filter(|c| applies_to_step(c, project_id, protocol_id, step_index))
            .cloned()
            .collect()
    }

    pub fn has_open_blockers(&self, project_id: &str, protocol_id: &str) -> bool {
        self.items
            .lock()
            .expect("clarification registry poisoned")
            .iter()
            .any(|c| c.is_open_blocker() && applies_to_protocol(c, project_id, protocol_id))
    }

    pub fn all_for_protocol(&self, project_id: &str, protocol_id: &str) -> Vec<Clarification> {
        self.items
            .lock()
            .expect("clarification registry poisoned")
            .iter()
            .filter(|c| applies_to_protocol(c, project_id, protocol_id))
            .cloned()
            .collect()
    }
}
