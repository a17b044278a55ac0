// Fallback bodies served when a backend cannot answer
pub mod fallback;

// Axum front end and gateway endpoints
pub mod server;

// Backend HTTP client
pub mod upstream;

pub use fallback::{FallbackProfile, FallbackResponder};
pub use server::{GatewayServer, shutdown_signal};
pub use upstream::{HttpUpstream, Upstream};
