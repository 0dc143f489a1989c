use std::sync::{Arc, Mutex, PoisonError};

use chat_core::{ClientEvent, OutboundEvent};
use chat_platform::StoredVisit;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EventHandler, TriggerCallbacks};
use crate::context::SessionContext;

/// Keeps the analytics visit alive across page views.
///
/// A page view after the visit window has lapsed mints a new visit and sends
/// `VisitStarted` ahead of the page view; otherwise the window is extended.
pub struct VisitEventHandler {
    inner: Arc<dyn EventHandler>,
    context: Arc<SessionContext>,
    // Serializes read-modify-write of the stored visit.
    guard: Mutex<()>,
}

impl VisitEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, context: Arc<SessionContext>) -> Self {
        Self {
            inner,
            context,
            guard: Mutex::new(()),
        }
    }

    fn touch_visit(&self) -> Option<Uuid> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let now_ms = self.context.clock.now_ms();
        let expires_at_ms = now_ms.saturating_add(self.context.config.visit_window.as_millis() as u64);

        let last = self.context.storage.last_visit().unwrap_or_else(|err| {
            warn!(error = %err, "stored visit unreadable; starting a new one");
            None
        });
        let (visit, started) = match last {
            Some(visit) if visit.expires_at_ms > now_ms => (
                StoredVisit {
                    expires_at_ms,
                    ..visit
                },
                None,
            ),
            _ => {
                let id = Uuid::new_v4();
                (StoredVisit { id, expires_at_ms }, Some(id))
            }
        };
        if let Err(err) = self.context.storage.set_last_visit(visit) {
            warn!(error = %err, "failed to persist visit");
        }
        started
    }
}

impl EventHandler for VisitEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        if matches!(event.payload, ClientEvent::PageViewStarted { .. })
            && let Some(visit_id) = self.touch_visit()
        {
            debug!(%visit_id, "starting new visit");
            self.inner.trigger(
                ClientEvent::VisitStarted { visit_id }.into(),
                TriggerCallbacks::none(),
            );
        }
        self.inner.trigger(event, callbacks);
    }
}
