//! Request id → decode context map.
//!
//! One `parking_lot::Mutex` guards the whole map. It is held only for the
//! map operation itself and never while a score row is being mutated, so
//! decode steps of unrelated requests do not serialize on each other.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::inference::RequestId;

/// Per-request state the grammar needs across decode steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Tokens in the prompt; generated tokens start at this index.
    pub prompt_len: usize,
    /// Force end-of-text once the first segment is closed.
    pub stop_after_first_segment: bool,
    /// Suppress space and end-of-text at the first text position.
    pub suppress_blank: bool,
    /// Latest timestamp step allowed as the first timestamp.
    pub max_initial_timestamp: Option<u32>,
    /// Decode steps observed so far.
    pub steps: usize,
}

impl DecodeContext {
    pub fn new(prompt_len: usize) -> Self {
        Self {
            prompt_len,
            stop_after_first_segment: false,
            suppress_blank: false,
            max_initial_timestamp: None,
            steps: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    contexts: Mutex<HashMap<RequestId, DecodeContext>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh context, replacing any previous one for `id`.
    pub fn register(&self, id: RequestId, prompt_len: usize) -> Option<DecodeContext> {
        self.register_context(id, DecodeContext::new(prompt_len))
    }

    pub fn register_context(&self, id: RequestId, context: DecodeContext) -> Option<DecodeContext> {
        self.contexts.lock().insert(id, context)
    }

    pub fn unregister(&self, id: RequestId) -> Option<DecodeContext> {
        self.contexts.lock().remove(&id)
    }

    /// Copy of the context, if registered.
    pub fn lookup(&self, id: RequestId) -> Option<DecodeContext> {
        self.contexts.lock().get(&id).copied()
    }

    /// Count one decode step and return the updated context.
    pub fn record_step(&self, id: RequestId) -> Option<DecodeContext> {
        let mut contexts = self.contexts.lock();
        let context = contexts.get_mut(&id)?;
        context.steps += 1;
        Some(*context)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}
