//! Ports for the edge gateway.
//!
//! Outbound traits the pipeline depends on; adapters live in `crate::adapters`.

pub mod outbound;

pub use outbound::{
    ForwardRequest, IdentitySource, KeyValidation, ManualClock, SystemTimeSource, TimeSource,
    Upstream, UpstreamResponse,
};
