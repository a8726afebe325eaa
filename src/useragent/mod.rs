mod useragent;
pub use useragent::{UserAgent, UserAgentBuilder};
pub mod transport;
pub use transport::{ResponseStream, RsipTransport, SessionTransport};
