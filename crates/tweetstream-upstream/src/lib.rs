pub mod decoder;
pub mod framing;
pub mod mock;
pub mod oauth1;
pub mod reliable;
pub mod twitter;

pub use decoder::{parse_frame, DecodeError, Decoder, Demux};
pub use framing::{FrameConfig, FrameReader};
pub use mock::{ScriptedResponse, ScriptedSource};
pub use reliable::{RetryConfig, RetryingSource};
pub use twitter::{TwitterConfig, TwitterSource, DEFAULT_OPEN_TIMEOUT};
