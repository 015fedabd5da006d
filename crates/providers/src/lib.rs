pub mod client;
pub mod http_transport;
pub mod traits;

pub use client::UpstreamClient;
pub use http_transport::HttpTransport;
pub use traits::{CallOptions, ChatMessage, Transport, TransportError, TransportResponse, UpstreamResult};
