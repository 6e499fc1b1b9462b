//! External adapter contracts: OS capabilities and the web engine.

pub mod fake;
pub mod os;
pub mod schema;
pub mod web;

pub use fake::{FakeOsAdapter, FakeWebEngine};
pub use os::{CapabilityDescriptor, LocalOsAdapter, OsAdapter, PermissionIssue};
pub use schema::{SchemaElement, ScreenSchema};
pub use web::{
    encode_batch, validate_batch_hosts, BatchJsonRpcEngine, ElementTarget, RpcTransport,
    WebEngine, WebOp,
};
