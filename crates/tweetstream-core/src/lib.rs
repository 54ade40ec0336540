pub mod credential;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod source;

pub use credential::{ConsumerKeys, Credential, CredentialError};
pub use errors::{UpstreamError, RATE_LIMIT_BACKOFF};
pub use frame::RawFrame;
pub use ids::SessionId;
pub use messages::{
    ContentItem, DirectNotification, LifecycleEvent, Message, MessageKind, StallWarning,
};
pub use source::{ByteStream, FilterParams, StreamSource, UpstreamStream};
