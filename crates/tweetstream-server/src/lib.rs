pub mod auth;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
pub mod wire;

pub use auth::{AuthError, CredentialResolver, SignedCookieResolver, StaticResolver, SESSION_COOKIE};
pub use registry::{SessionInfo, SessionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{CloseReason, ConnectionSession, SessionConfig, SessionError, SessionSummary};
pub use sink::{ClientSink, RecordingSink, SinkError, SseSink, Transport, WsSink};
