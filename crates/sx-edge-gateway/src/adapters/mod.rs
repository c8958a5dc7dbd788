//! Adapters for the edge gateway.
//!
//! Infrastructure implementations of the outbound ports.

pub mod control_plane;
pub mod memory;
pub mod upstream;

pub use control_plane::ControlPlaneClient;
pub use memory::{InMemoryIdentitySource, KeyAdminError};
pub use upstream::{build_upstream_url, forwardable_request_headers, HttpUpstream};
