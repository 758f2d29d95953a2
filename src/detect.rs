//! Change detection between the remote listing and the local state.

use crate::types::{RemoteObject, SyncState};

/// Returns true if `object` must be downloaded.
///
/// An object is up to date only if its key has a successful record whose
/// etag matches byte for byte. A failed attempt is never up to date, even
/// when the etag matches; how often to retry is the caller's policy.
pub fn needs_download(object: &RemoteObject, state: &SyncState) -> bool {
    match state.record(&object.key) {
        None => true,
        Some(record) => !record.success || record.etag != object.etag,
    }
}
