pub mod router;

pub use router::{RouteAccess, RouteDecision, RouteRule, RouteTable};
