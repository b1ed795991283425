//! Authorization-gated control surface.

pub mod acl;
pub mod protocol;

pub use acl::{AccessPolicy, Caller, Operation, ACL_ALLOW_ALL};
pub use protocol::{ControlGateway, ControlRequest, ControlResponse, ErrorReply};
