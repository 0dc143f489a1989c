use std::sync::Arc;

use chat_core::{
    AccessToken, Cancellable, ChatError, ClientEvent, CustomerIdentity, EventType,
    ServerErrorKind, ServerEvent, normalize_background_failure, normalize_server_error,
};
use chat_platform::StoredToken;
use tracing::{debug, info, warn};

use super::{ChatSession, trigger_reported};
use crate::{
    context::{LifecycleEvent, SessionContext, map_storage_error},
    pipeline::EventPipeline,
};

/// Authorizes the customer on every open and keeps the stored access token
/// current.
///
/// A still-valid stored token is offered with `reconnectCustomer`; otherwise
/// a fresh `authorizeCustomer` is sent, carrying the authorization code when
/// the channel requires one. Held events are released once a token arrives.
pub struct AuthorizationChatSession {
    inner: Arc<dyn ChatSession>,
    subscriptions: Cancellable,
}

impl AuthorizationChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = Arc::clone(inner.context());
        let events = inner.events().clone();

        let opened = {
            let (session, events) = (Arc::clone(&context), events.clone());
            context.lifecycle.subscribe(move |event| {
                if *event == LifecycleEvent::Opened {
                    authorize(&session, &events);
                }
            })
        };

        let authorized = {
            let (session, events) = (Arc::clone(&context), events.clone());
            context
                .dispatcher
                .subscribe(EventType::CustomerAuthorized, move |event| {
                    if let ServerEvent::CustomerAuthorized {
                        access_token,
                        customer,
                    } = event
                    {
                        info!("customer authorized");
                        store_token(&session, access_token);
                        if let Some(customer) = customer {
                            adopt_customer(&session, customer);
                        }
                        events.auth_delay.flush(true);
                    }
                })
        };

        let refreshed = {
            let (session, events) = (Arc::clone(&context), events.clone());
            context
                .dispatcher
                .subscribe(EventType::TokenRefreshed, move |event| {
                    if let ServerEvent::TokenRefreshed { access_token } = event {
                        debug!(expires_at_ms = access_token.expires_at_ms, "access token refreshed");
                        store_token(&session, access_token);
                        events.auth_delay.flush(false);
                    }
                })
        };

        let [authorization_failed, refresh_failed] = [
            ServerErrorKind::CustomerAuthorizationFailed,
            ServerErrorKind::TokenRefreshingFailed,
        ]
        .map(|kind| {
            let reporter = Arc::clone(&context);
            context.dispatcher.subscribe_error(kind, move |error| {
                reporter.report(normalize_server_error(error));
            })
        });

        let reconnect_failed = {
            let session = Arc::clone(&context);
            context.dispatcher.subscribe_error(
                ServerErrorKind::CustomerReconnectFailed,
                move |error| {
                    warn!(message = %error.message, "stored token rejected; authorizing anew");
                    if let Err(err) = session.storage.clear_token() {
                        session.report(normalize_background_failure(
                            "clear_access_token",
                            map_storage_error(err),
                        ));
                    }
                    send_authorize(&session, &events);
                },
            )
        };

        Self {
            inner,
            subscriptions: Cancellable::compound([
                opened,
                authorized,
                refreshed,
                authorization_failed,
                refresh_failed,
                reconnect_failed,
            ]),
        }
    }
}

impl ChatSession for AuthorizationChatSession {
    fn context(&self) -> &Arc<SessionContext> {
        self.inner.context()
    }

    fn events(&self) -> &EventPipeline {
        self.inner.events()
    }

    fn connect(&self) -> Result<(), ChatError> {
        self.inner.connect()
    }

    fn close(&self) {
        self.subscriptions.cancel();
        self.inner.close();
    }
}

fn authorize(context: &Arc<SessionContext>, events: &EventPipeline) {
    let now_ms = context.clock.now_ms();
    match context.access_token() {
        Some(token) if token.expires_at_ms > now_ms => {
            debug!("offering stored access token");
            trigger_reported(
                context,
                events,
                ClientEvent::ReconnectCustomer { token: token.token },
                "reconnect_customer",
            );
        }
        _ => send_authorize(context, events),
    }
}

fn send_authorize(context: &Arc<SessionContext>, events: &EventPipeline) {
    let code = if context.channel.is_authorization_enabled {
        context.authorization_code()
    } else {
        None
    };
    if context.channel.is_authorization_enabled && code.is_none() {
        warn!("channel requires an authorization code but none is set");
    }
    let (authorization_code, code_verifier) = match code {
        Some(code) => (Some(code.code), code.verifier),
        None => (None, None),
    };
    trigger_reported(
        context,
        events,
        ClientEvent::AuthorizeCustomer {
            authorization_code,
            code_verifier,
        },
        "authorize_customer",
    );
}

fn store_token(context: &SessionContext, token: &AccessToken) {
    let stored = StoredToken {
        token: token.token.clone(),
        expires_at_ms: token.expires_at_ms,
    };
    if let Err(err) = context.storage.set_token(&stored) {
        context.report(normalize_background_failure(
            "store_access_token",
            map_storage_error(err),
        ));
    }
}

/// The backend may assign or enrich the customer identity on authorization.
fn adopt_customer(context: &SessionContext, customer: &CustomerIdentity) {
    if let Err(err) = context.storage.set_customer_id(&customer.id) {
        context.report(normalize_background_failure(
            "store_customer_id",
            map_storage_error(err),
        ));
    }
    let connection = context.connection().with_customer(customer.clone());
    context.replace_connection(connection);
}
