/// KV key layout for face records.
///
/// ```text
/// face:f:{id}            → JSON Face
/// face:s:{uid}           → JSON Subject
/// face:m:{uid}           → JSON Marker
/// face:file:{file_uid}   → JSON FileRecord
/// face:refresh:{file_uid}→ RFC 3339 timestamp of the last flag
/// ```
///
/// Marker keys sort by uid, which is what the matching pass pages over.
pub const FACE_PREFIX: &str = "face:f:";
pub const SUBJECT_PREFIX: &str = "face:s:";
pub const MARKER_PREFIX: &str = "face:m:";
pub const FILE_PREFIX: &str = "face:file:";
pub const REFRESH_PREFIX: &str = "face:refresh:";

pub fn face_key(id: &str) -> String {
    format!("{FACE_PREFIX}{id}")
}

pub fn subject_key(uid: &str) -> String {
    format!("{SUBJECT_PREFIX}{uid}")
}

pub fn marker_key(uid: &str) -> String {
    format!("{MARKER_PREFIX}{uid}")
}

pub fn file_key(file_uid: &str) -> String {
    format!("{FILE_PREFIX}{file_uid}")
}

pub fn refresh_key(file_uid: &str) -> String {
    format!("{REFRESH_PREFIX}{file_uid}")
}

/// Strips `prefix` from a scanned key.
pub fn key_id<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}
