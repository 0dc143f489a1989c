use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use uuid::Uuid;

/// Shared "conversation not yet started" flag of one live-chat thread.
///
/// The start sequence runs while the flag is held, so events triggered by any
/// other handler of the same thread queue up behind it.
#[derive(Debug, Default)]
pub struct ConversationStart {
    pending: Mutex<bool>,
}

impl ConversationStart {
    fn new(pending: bool) -> Self {
        Self {
            pending: Mutex::new(pending),
        }
    }

    /// Run `start` if the sequence is still owed. Only one caller ever runs it,
    /// and concurrent callers return only after it finished.
    pub fn claim_with(&self, start: impl FnOnce()) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            return false;
        }
        *pending = false;
        start();
        true
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// Conversation-start flags for live-chat threads, shared by every handler
/// instance of the same thread id.
///
/// Owned by the client. A cell is dropped from the registry when a handler
/// of its thread is closed; handlers still holding it keep sharing it.
#[derive(Debug, Default)]
pub struct LiveChatWelcomeRegistry {
    cells: Mutex<HashMap<Uuid, Arc<ConversationStart>>>,
}

impl LiveChatWelcomeRegistry {
    /// Cell for a thread the customer just created; the start sequence is
    /// still owed.
    pub fn arm(&self, thread_id: Uuid) -> Arc<ConversationStart> {
        self.cell_with(thread_id, true)
    }

    /// Cell for an existing thread; nothing is owed unless some other handler
    /// armed it.
    pub fn cell(&self, thread_id: Uuid) -> Arc<ConversationStart> {
        self.cell_with(thread_id, false)
    }

    pub fn remove(&self, thread_id: Uuid) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread_id);
    }

    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_with(&self, thread_id: Uuid, pending: bool) -> Arc<ConversationStart> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let cell = cells
            .entry(thread_id)
            .or_insert_with(|| Arc::new(ConversationStart::new(false)));
        if pending {
            cell.arm();
        }
        Arc::clone(cell)
    }
}
