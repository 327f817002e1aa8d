//! Identifier limits for warehouse resources.
//!
//! These mirror the naming rules of the warehouse closely enough to reject
//! garbage on the bus without rejecting anything the warehouse accepts.
//! The `#[validate]` derive macro requires literal values in attributes,
//! so length limits are duplicated there. Keep both in sync when modifying.

/// Maximum project ID length (domain-scoped IDs included).
pub const MAX_PROJECT_ID_LEN: usize = 128;

/// Maximum dataset ID length.
pub const MAX_DATASET_ID_LEN: usize = 1024;

/// Maximum table ID length in bytes.
pub const MAX_TABLE_ID_LEN: usize = 1024;

/// Project IDs: alphanumerics plus `-`, `.`, `:` and `_` (legacy
/// domain-scoped projects look like `example.com:my-project`).
pub const PROJECT_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$";

/// Dataset IDs: letters, digits and underscores only.
pub const DATASET_ID_PATTERN: &str = r"^[A-Za-z0-9_]+$";

/// Table IDs allow unicode and spaces but never path separators or
/// control characters.
pub const TABLE_ID_PATTERN: &str = r"^[^/\x00-\x1f]+$";
