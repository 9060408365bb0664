//! Naming data model.
//!
//! - `ServiceKey`: namespace/group/service/clusters tuple used as a map key
//! - `InstanceRecord`: a single registered instance
//! - `ServiceSnapshot`: immutable instance list for a key with a content fingerprint

mod instance;
mod key;
mod snapshot;

pub use instance::InstanceRecord;
pub use key::ServiceKey;
pub use snapshot::ServiceSnapshot;

/// Group used when the caller does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
/// Namespace used when the caller does not name one.
pub const DEFAULT_NAMESPACE: &str = "public";
/// Cluster assigned to instances registered without one.
pub const DEFAULT_CLUSTER: &str = "DEFAULT";
/// Separator between group and service name in grouped names.
pub const GROUP_SEPARATOR: &str = "@@";
