//! Classification helpers for object identifiers.
//!
//! An object id is an opaque `i64` with three regions: `0` is the persisted
//! null reference, negative values mean "not yet assigned by the store", and
//! positive values are proper identifiers resolvable through a loader.

/// The persisted null reference.
pub const NULL_OID: i64 = 0;

/// Sentinel for a subject that exists in memory but has not been persisted.
pub const UNMAPPED_OID: i64 = -1;

pub fn is_null_oid(oid: i64) -> bool {
    oid == NULL_OID
}

/// A proper identifier resolvable through the backing store.
pub fn is_proper_oid(oid: i64) -> bool {
    oid > NULL_OID
}

pub fn is_not_proper_oid(oid: i64) -> bool {
    !is_proper_oid(oid)
}

/// Proper or null, i.e. the reference has been persisted ("stored").
pub fn is_found_oid(oid: i64) -> bool {
    oid >= NULL_OID
}

/// Id for a subject that bypassed persistence: null maps to [`NULL_OID`],
/// a live subject to the unmapped sentinel.
pub fn to_unmapped_oid(has_subject: bool) -> i64 {
    if has_subject {
        UNMAPPED_OID
    } else {
        NULL_OID
    }
}
