pub mod auth_relay;
pub mod authorization;
pub mod dispatch;
pub mod pipeline;
pub mod request_logging;

pub use auth_relay::AuthRelayStage;
pub use authorization::AuthorizationStage;
pub use dispatch::DispatchStage;
pub use pipeline::{Pipeline, Stage, StageResult};
pub use request_logging::RequestLoggingStage;
