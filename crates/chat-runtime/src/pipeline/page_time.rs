use std::sync::{Arc, Mutex, PoisonError};

use chat_core::{ClientEvent, OutboundEvent};
use tracing::debug;

use super::{EventHandler, TriggerCallbacks};
use crate::context::SessionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenPage {
    uri: String,
    title: String,
    started_at_ms: u64,
}

/// Coalesces page-view start/end pairs into one time-on-page event.
///
/// A repeated start of the open page is dropped; a start of another page
/// first closes the open one.
pub struct PageTimeEventHandler {
    inner: Arc<dyn EventHandler>,
    context: Arc<SessionContext>,
    open: Mutex<Option<OpenPage>>,
}

impl PageTimeEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, context: Arc<SessionContext>) -> Self {
        Self {
            inner,
            context,
            open: Mutex::new(None),
        }
    }

    fn time_spent(page: OpenPage, now_ms: u64) -> OutboundEvent {
        ClientEvent::TimeSpentOnPage {
            time_spent_ms: now_ms.saturating_sub(page.started_at_ms),
            uri: page.uri,
            title: page.title,
        }
        .into()
    }
}

impl EventHandler for PageTimeEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        let now_ms = self.context.clock.now_ms();
        match &event.payload {
            ClientEvent::PageViewStarted { uri, title } => {
                let dangling = {
                    let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
                    if open
                        .as_ref()
                        .is_some_and(|page| page.uri == *uri && page.title == *title)
                    {
                        debug!(%uri, "duplicate page view start suppressed");
                        drop(open);
                        callbacks.sent();
                        return;
                    }
                    open.replace(OpenPage {
                        uri: uri.clone(),
                        title: title.clone(),
                        started_at_ms: now_ms,
                    })
                };
                if let Some(page) = dangling {
                    self.inner
                        .trigger(Self::time_spent(page, now_ms), TriggerCallbacks::none());
                }
                self.inner.trigger(event, callbacks);
            }
            ClientEvent::PageViewEnded { uri, title } => {
                let closed = {
                    let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
                    if open
                        .as_ref()
                        .is_some_and(|page| page.uri == *uri && page.title == *title)
                    {
                        open.take()
                    } else {
                        None
                    }
                };
                match closed {
                    Some(page) => self.inner.trigger(Self::time_spent(page, now_ms), callbacks),
                    None => {
                        debug!(%uri, "page view end without matching start dropped");
                        callbacks.sent();
                    }
                }
            }
            _ => self.inner.trigger(event, callbacks),
        }
    }
}
