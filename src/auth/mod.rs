pub mod policy;
pub mod roles;
pub mod token;

pub use policy::{AccessPolicy, AuthorizedRequest, HeaderDirective};
pub use roles::{Role, RoleHierarchy};
pub use token::{TokenClaims, TokenValidator};
