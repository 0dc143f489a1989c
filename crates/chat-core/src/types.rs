use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend endpoints a connection talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Duplex socket endpoint, for example `wss://chat.example.com`.
    pub socket_url: String,
    /// HTTP base used for channel metadata, availability and uploads.
    pub chat_url: String,
}

/// Identity of the consumer the client acts for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CustomerIdentity {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl CustomerIdentity {
    /// Create an identity with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: None,
            last_name: None,
        }
    }

    /// `first last`, or whichever half is present.
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Immutable connection descriptor.
///
/// Replaced wholesale when the identity changes (for example after the
/// backend authorizes the customer and hands out a new id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub brand_id: u64,
    pub channel_id: String,
    pub customer: CustomerIdentity,
    pub visitor_id: Uuid,
    pub environment: Environment,
}

impl Connection {
    /// Copy of this connection with a different customer identity.
    pub fn with_customer(&self, customer: CustomerIdentity) -> Self {
        Self {
            customer,
            ..self.clone()
        }
    }

    /// Name shown to agents, derived from the customer identity.
    pub fn display_name(&self) -> Option<String> {
        self.customer.full_name()
    }
}

/// Threading topology configured for the channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatMode {
    /// One long-lived thread, recovered automatically on connect.
    SingleThread,
    /// Any number of threads, listed on connect.
    MultiThread,
    /// One live conversation at a time, gated on agent availability.
    LiveChat,
}

/// Connection state published to the application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Authorized and initial thread state recovered.
    Ready,
    /// Live-chat channel has no agents available.
    Offline,
    Reconnecting,
    UnexpectedDisconnect,
}

/// Who a message is addressed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageDirection {
    /// Sent by the customer.
    ToAgent,
    /// Sent by an agent, bot or the backend.
    ToClient,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuickReplyOption {
    pub text: String,
    #[serde(default)]
    pub postback: Option<String>,
}

/// Message body variants understood by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default)]
        postback: Option<String>,
    },
    RichLink {
        title: String,
        url: String,
    },
    QuickReplies {
        title: String,
        options: Vec<QuickReplyOption>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            postback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub friendly_name: String,
    pub mime_type: String,
}

/// One message in a thread.
///
/// Append-only from the client's point of view; only the read/seen
/// timestamps are patched in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub direction: MessageDirection,
    pub content: MessageContent,
    pub created_at_ms: u64,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub seen_at_ms: Option<u64>,
    #[serde(default)]
    pub read_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
}

/// Lifecycle of a thread as seen by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Created locally, not confirmed by the backend.
    Pending,
    /// Metadata fetched.
    Loaded,
    /// Fully recovered, messages and agent known.
    Ready,
    /// Terminal.
    Closed,
}

/// Backend case (contact) status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    New,
    Open,
    Pending,
    Escalated,
    Resolved,
    Closed,
}

/// Scope a custom field is tracked under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CustomFieldScope {
    Customer,
    Contact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl CustomField {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            updated_at_ms: 0,
        }
    }
}

/// Merge `incoming` into `existing`, replacing values with the same id.
pub fn merge_custom_fields(existing: &[CustomField], incoming: &[CustomField]) -> Vec<CustomField> {
    let mut merged = existing.to_vec();
    for field in incoming {
        match merged.iter_mut().find(|current| current.id == field.id) {
            Some(current) => *current = field.clone(),
            None => merged.push(field.clone()),
        }
    }
    merged
}

/// Snapshot of one thread.
///
/// Handlers never hand out references into their mutable record; readers get
/// a clone of this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatThread {
    pub id: Uuid,
    pub name: Option<String>,
    pub messages: Vec<Message>,
    pub scroll_token: Option<String>,
    pub agent: Option<Agent>,
    pub state: ThreadState,
    pub contact_fields: Vec<CustomField>,
    pub can_add_more_messages: bool,
    pub position_in_queue: Option<u32>,
    pub has_online_agent: bool,
    pub contact_id: Option<String>,
}

impl ChatThread {
    /// Fresh locally-created thread.
    pub fn pending(id: Uuid) -> Self {
        Self {
            id,
            name: None,
            messages: Vec::new(),
            scroll_token: None,
            agent: None,
            state: ThreadState::Pending,
            contact_fields: Vec::new(),
            can_add_more_messages: true,
            position_in_queue: None,
            has_online_agent: false,
            contact_id: None,
        }
    }

    pub fn has_more_messages_to_load(&self) -> bool {
        self.scroll_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

/// Access token issued by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_at_ms: u64,
}

/// Thread body delivered on recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredThread {
    pub thread_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub scroll_token: Option<String>,
    #[serde(default)]
    pub agent: Option<Agent>,
    #[serde(default)]
    pub contact_id: Option<String>,
    pub status: CaseStatus,
    #[serde(default)]
    pub contact_fields: Vec<CustomField>,
    #[serde(default)]
    pub customer_fields: Vec<CustomField>,
    #[serde(default)]
    pub position_in_queue: Option<u32>,
}

/// Entry of the thread list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub can_add_more_messages: bool,
}

/// Server-initiated payload not requested by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "actionType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ProactiveAction {
    WelcomeMessage {
        action_id: Uuid,
        text: String,
    },
    CustomPopup {
        action_id: Uuid,
        payload: serde_json::Value,
    },
}

/// Decoded inbound event, either from the wire or synthesized locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    CustomerAuthorized {
        access_token: AccessToken,
        #[serde(default)]
        customer: Option<CustomerIdentity>,
    },
    TokenRefreshed {
        access_token: AccessToken,
    },
    ThreadRecovered {
        thread: RecoveredThread,
    },
    ThreadListFetched {
        threads: Vec<ThreadSummary>,
    },
    ThreadMetadataLoaded {
        thread_id: Uuid,
        #[serde(default)]
        last_message: Option<Message>,
        #[serde(default)]
        agent: Option<Agent>,
    },
    MessageCreated {
        message: Message,
    },
    MoreMessagesLoaded {
        thread_id: Uuid,
        messages: Vec<Message>,
        #[serde(default)]
        scroll_token: Option<String>,
    },
    MessageReadChanged {
        thread_id: Uuid,
        message_id: Uuid,
        #[serde(default)]
        seen_at_ms: Option<u64>,
        #[serde(default)]
        read_at_ms: Option<u64>,
    },
    AgentTyping {
        thread_id: Uuid,
        is_typing: bool,
    },
    AssignedAgentChanged {
        thread_id: Uuid,
        #[serde(default)]
        agent: Option<Agent>,
    },
    QueuePositionChanged {
        thread_id: Uuid,
        position: u32,
        #[serde(default)]
        has_online_agent: bool,
    },
    CaseStatusChanged {
        thread_id: Uuid,
        #[serde(default)]
        contact_id: Option<String>,
        status: CaseStatus,
    },
    ThreadArchived {
        thread_id: Uuid,
    },
    /// Generic thread update. Also synthesized by the client so local state
    /// changes reach observers through the same path as wire events.
    ThreadUpdated {
        thread_id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        can_add_more_messages: Option<bool>,
        #[serde(default)]
        state: Option<ThreadState>,
    },
    ProactiveAction {
        action: ProactiveAction,
    },
    /// Event body too large to inline; must be fetched from `url`.
    ExternalPayload {
        url: String,
    },
}

/// Discriminant of [`ServerEvent`], used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CustomerAuthorized,
    TokenRefreshed,
    ThreadRecovered,
    ThreadListFetched,
    ThreadMetadataLoaded,
    MessageCreated,
    MoreMessagesLoaded,
    MessageReadChanged,
    AgentTyping,
    AssignedAgentChanged,
    QueuePositionChanged,
    CaseStatusChanged,
    ThreadArchived,
    ThreadUpdated,
    ProactiveAction,
    ExternalPayload,
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CustomerAuthorized { .. } => EventType::CustomerAuthorized,
            Self::TokenRefreshed { .. } => EventType::TokenRefreshed,
            Self::ThreadRecovered { .. } => EventType::ThreadRecovered,
            Self::ThreadListFetched { .. } => EventType::ThreadListFetched,
            Self::ThreadMetadataLoaded { .. } => EventType::ThreadMetadataLoaded,
            Self::MessageCreated { .. } => EventType::MessageCreated,
            Self::MoreMessagesLoaded { .. } => EventType::MoreMessagesLoaded,
            Self::MessageReadChanged { .. } => EventType::MessageReadChanged,
            Self::AgentTyping { .. } => EventType::AgentTyping,
            Self::AssignedAgentChanged { .. } => EventType::AssignedAgentChanged,
            Self::QueuePositionChanged { .. } => EventType::QueuePositionChanged,
            Self::CaseStatusChanged { .. } => EventType::CaseStatusChanged,
            Self::ThreadArchived { .. } => EventType::ThreadArchived,
            Self::ThreadUpdated { .. } => EventType::ThreadUpdated,
            Self::ProactiveAction { .. } => EventType::ProactiveAction,
            Self::ExternalPayload { .. } => EventType::ExternalPayload,
        }
    }

    /// Thread this event targets, when it targets exactly one.
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            Self::ThreadRecovered { thread } => Some(thread.thread_id),
            Self::MessageCreated { message } => Some(message.thread_id),
            Self::ThreadMetadataLoaded { thread_id, .. }
            | Self::MoreMessagesLoaded { thread_id, .. }
            | Self::MessageReadChanged { thread_id, .. }
            | Self::AgentTyping { thread_id, .. }
            | Self::AssignedAgentChanged { thread_id, .. }
            | Self::QueuePositionChanged { thread_id, .. }
            | Self::CaseStatusChanged { thread_id, .. }
            | Self::ThreadArchived { thread_id }
            | Self::ThreadUpdated { thread_id, .. } => Some(*thread_id),
            Self::CustomerAuthorized { .. }
            | Self::TokenRefreshed { .. }
            | Self::ThreadListFetched { .. }
            | Self::ProactiveAction { .. }
            | Self::ExternalPayload { .. } => None,
        }
    }
}

/// Tag identifying which server operation failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServerErrorKind {
    SendMessageFailed,
    ArchivingThreadFailed,
    RecoveringThreadFailed,
    RecoveringLivechatFailed,
    MetadataLoadFailed,
    LoadMoreMessagesFailed,
    FetchThreadListFailed,
    CustomerAuthorizationFailed,
    CustomerReconnectFailed,
    TokenRefreshingFailed,
    SettingCustomFieldsFailed,
    EndContactFailed,
    InconsistentData,
    #[serde(other)]
    Unknown,
}

/// Error frame sent by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorEvent {
    pub kind: ServerErrorKind,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub message: String,
}

/// Client-to-server event payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    AuthorizeCustomer {
        authorization_code: Option<String>,
        code_verifier: Option<String>,
    },
    ReconnectCustomer {
        token: String,
    },
    RefreshToken {
        token: String,
    },
    FetchThreadList,
    RecoverThread {
        thread_id: Option<Uuid>,
    },
    RecoverLiveChat {
        thread_id: Option<Uuid>,
    },
    LoadThreadMetadata {
        thread_id: Uuid,
    },
    LoadMoreMessages {
        thread_id: Uuid,
        scroll_token: String,
        oldest_message_id: Option<Uuid>,
    },
    SendMessage {
        thread_id: Uuid,
        message_id: Uuid,
        content: MessageContent,
        attachments: Vec<Attachment>,
    },
    /// Welcome message sent on behalf of the brand.
    SendOutbound {
        thread_id: Uuid,
        message_id: Uuid,
        text: String,
    },
    /// Live-chat sentinel that opens the conversation.
    StartConversation {
        thread_id: Uuid,
    },
    ArchiveThread {
        thread_id: Uuid,
    },
    EndContact {
        thread_id: Uuid,
        contact_id: Option<String>,
    },
    MarkThreadRead {
        thread_id: Uuid,
    },
    SetTyping {
        thread_id: Uuid,
        is_typing: bool,
    },
    UpdateThreadName {
        thread_id: Uuid,
        name: String,
    },
    SetCustomerCustomFields {
        fields: Vec<CustomField>,
    },
    SetContactCustomFields {
        thread_id: Uuid,
        fields: Vec<CustomField>,
    },
    VisitStarted {
        visit_id: Uuid,
    },
    PageViewStarted {
        uri: String,
        title: String,
    },
    PageViewEnded {
        uri: String,
        title: String,
    },
    TimeSpentOnPage {
        uri: String,
        title: String,
        time_spent_ms: u64,
    },
    ProactiveActionDisplayed {
        action_id: Uuid,
    },
    ProactiveActionClicked {
        action_id: Uuid,
    },
    ConversionReported {
        conversion_type: String,
        value: f64,
    },
}

impl ClientEvent {
    /// Stable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthorizeCustomer { .. } => "authorize_customer",
            Self::ReconnectCustomer { .. } => "reconnect_customer",
            Self::RefreshToken { .. } => "refresh_token",
            Self::FetchThreadList => "fetch_thread_list",
            Self::RecoverThread { .. } => "recover_thread",
            Self::RecoverLiveChat { .. } => "recover_live_chat",
            Self::LoadThreadMetadata { .. } => "load_thread_metadata",
            Self::LoadMoreMessages { .. } => "load_more_messages",
            Self::SendMessage { .. } => "send_message",
            Self::SendOutbound { .. } => "send_outbound",
            Self::StartConversation { .. } => "start_conversation",
            Self::ArchiveThread { .. } => "archive_thread",
            Self::EndContact { .. } => "end_contact",
            Self::MarkThreadRead { .. } => "mark_thread_read",
            Self::SetTyping { .. } => "set_typing",
            Self::UpdateThreadName { .. } => "update_thread_name",
            Self::SetCustomerCustomFields { .. } => "set_customer_custom_fields",
            Self::SetContactCustomFields { .. } => "set_contact_custom_fields",
            Self::VisitStarted { .. } => "visit_started",
            Self::PageViewStarted { .. } => "page_view_started",
            Self::PageViewEnded { .. } => "page_view_ended",
            Self::TimeSpentOnPage { .. } => "time_spent_on_page",
            Self::ProactiveActionDisplayed { .. } => "proactive_action_displayed",
            Self::ProactiveActionClicked { .. } => "proactive_action_clicked",
            Self::ConversionReported { .. } => "conversion_reported",
        }
    }

    /// Events that obtain or renew the access token.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            Self::AuthorizeCustomer { .. }
                | Self::ReconnectCustomer { .. }
                | Self::RefreshToken { .. }
        )
    }

    /// Visitor analytics; these do not require an authorized customer.
    pub fn is_analytics(&self) -> bool {
        matches!(
            self,
            Self::VisitStarted { .. }
                | Self::PageViewStarted { .. }
                | Self::PageViewEnded { .. }
                | Self::TimeSpentOnPage { .. }
                | Self::ProactiveActionDisplayed { .. }
                | Self::ProactiveActionClicked { .. }
                | Self::ConversionReported { .. }
        )
    }
}

/// Client event paired with the id used to correlate server replies.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_id: Uuid,
    pub payload: ClientEvent,
}

impl OutboundEvent {
    pub fn new(payload: ClientEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            payload,
        }
    }
}

impl From<ClientEvent> for OutboundEvent {
    fn from(payload: ClientEvent) -> Self {
        Self::new(payload)
    }
}

/// Wire envelope for an outbound event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope<'a> {
    pub event_id: Uuid,
    pub brand_id: u64,
    pub channel_id: &'a str,
    pub visitor_id: Uuid,
    pub customer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<&'a str>,
    #[serde(flatten)]
    pub payload: &'a ClientEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_skips_missing_parts() {
        let mut customer = CustomerIdentity::new("c-1");
        assert_eq!(customer.full_name(), None);

        customer.first_name = Some("Ann".into());
        assert_eq!(customer.full_name().as_deref(), Some("Ann"));

        customer.last_name = Some(" Lee ".into());
        assert_eq!(customer.full_name().as_deref(), Some("Ann Lee"));
    }

    #[test]
    fn custom_field_merge_replaces_by_id() {
        let merged = merge_custom_fields(
            &[CustomField::new("topic", "sales"), CustomField::new("vip", "no")],
            &[CustomField::new("topic", "billing"), CustomField::new("lang", "en")],
        );
        let ids: Vec<_> = merged.iter().map(|f| (f.id.as_str(), f.value.as_str())).collect();
        assert_eq!(ids, vec![("topic", "billing"), ("vip", "no"), ("lang", "en")]);
    }

    #[test]
    fn server_event_reports_type_and_thread() {
        let thread_id = Uuid::new_v4();
        let event = ServerEvent::AgentTyping {
            thread_id,
            is_typing: true,
        };
        assert_eq!(event.event_type(), EventType::AgentTyping);
        assert_eq!(event.thread_id(), Some(thread_id));

        let event = ServerEvent::ExternalPayload {
            url: "https://files.example.com/e/1".into(),
        };
        assert_eq!(event.thread_id(), None);
    }

    #[test]
    fn classifies_client_events() {
        assert!(ClientEvent::RefreshToken { token: "t".into() }.is_authorization());
        assert!(
            ClientEvent::PageViewStarted {
                uri: "/".into(),
                title: "Home".into()
            }
            .is_analytics()
        );
        assert!(!ClientEvent::FetchThreadList.is_analytics());
        assert!(!ClientEvent::FetchThreadList.is_authorization());
    }
}
