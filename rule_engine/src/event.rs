//! Change events describing how the watched KV tree moved.

/// One observed change under the watched prefix.
///
/// Paths are relative to the prefix (`g/1`, `u/alice/2`) and values are the
/// raw KV text, parsed later by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added { path: String, value: String },
    Updated { path: String, value: String },
    Removed { path: String },
    /// Full tree contents, emitted when incremental diffing is not possible.
    Resynced { entries: Vec<(String, String)> },
}

impl ChangeEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added { .. } => "added",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Removed { .. } => "removed",
            ChangeEvent::Resynced { .. } => "resynced",
        }
    }

    /// Path touched by an incremental event.
    pub fn path(&self) -> Option<&str> {
        match self {
            ChangeEvent::Added { path, .. }
            | ChangeEvent::Updated { path, .. }
            | ChangeEvent::Removed { path } => Some(path),
            ChangeEvent::Resynced { .. } => None,
        }
    }
}
