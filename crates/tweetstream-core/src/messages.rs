use serde::{Deserialize, Serialize};

/// One decoded upstream message. Produced only from a frame that parsed
/// completely; partial or malformed frames never become a `Message`.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Content(ContentItem),
    Direct(DirectNotification),
    Lifecycle(LifecycleEvent),
    Warning(StallWarning),
    Unknown,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Content(_) => MessageKind::Content,
            Self::Direct(_) => MessageKind::Direct,
            Self::Lifecycle(_) => MessageKind::Lifecycle,
            Self::Warning(_) => MessageKind::Warning,
            Self::Unknown => MessageKind::Unknown,
        }
    }
}

/// Discriminant of [`Message`], used for routing and metric labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Content,
    Direct,
    Lifecycle,
    Warning,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Direct => "direct",
            Self::Lifecycle => "lifecycle",
            Self::Warning => "warning",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status update: the only kind relayed to clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Option<String>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub author_handle: Option<String>,
    pub body: String,
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectNotification {
    pub id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub recipient_id: Option<String>,
    pub body: String,
}

/// Control notices the upstream interleaves with content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StatusDeletion {
        id: Option<String>,
        user_id: Option<String>,
    },
    LocationDeletion {
        user_id: Option<String>,
        up_to_status_id: Option<String>,
    },
    /// Matching statuses the upstream could not deliver due to rate limits.
    Limit { undelivered: u64 },
    StatusWithheld {
        id: Option<String>,
        user_id: Option<String>,
        countries: Vec<String>,
    },
    UserWithheld {
        id: Option<String>,
        countries: Vec<String>,
    },
    /// The upstream is about to close the connection.
    Disconnect {
        code: u32,
        stream_name: Option<String>,
        reason: String,
    },
    FriendsList { friend_ids: Vec<u64> },
    UserEvent {
        event: String,
        source_id: Option<String>,
        target_id: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusDeletion { .. } => "status_deletion",
            Self::LocationDeletion { .. } => "location_deletion",
            Self::Limit { .. } => "limit",
            Self::StatusWithheld { .. } => "status_withheld",
            Self::UserWithheld { .. } => "user_withheld",
            Self::Disconnect { .. } => "disconnect",
            Self::FriendsList { .. } => "friends_list",
            Self::UserEvent { .. } => "user_event",
        }
    }
}

/// Sent when the client is falling behind and the upstream queue fills.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallWarning {
    pub code: String,
    pub message: String,
    pub percent_full: Option<u32>,
}
