//! Weighted instance selection.
//!
//! A `Chooser` is an immutable snapshot of weighted items. It is built once
//! per instance-list change and swapped in whole by the cache, so readers
//! never see a partially built structure.

mod chooser;

pub use chooser::{Chooser, ChooserError};

use crate::model::{InstanceRecord, ServiceKey, ServiceSnapshot};

/// Chooser over the selectable instances of one service.
pub type InstanceChooser = Chooser<ServiceKey, InstanceRecord>;

/// Build a chooser from the healthy, enabled instances of a snapshot.
///
/// Zero-weight instances are kept as items so that an all-zero list is
/// reported as `NoEligibleCandidate` rather than `Empty`.
pub fn instance_chooser(snapshot: &ServiceSnapshot) -> Result<InstanceChooser, ChooserError> {
    let pairs = snapshot
        .instances
        .iter()
        .filter(|i| i.healthy && i.enabled)
        .map(|i| (i.clone(), i.weight))
        .collect();
    Chooser::build(snapshot.key.clone(), pairs)
}
