use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque asset identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(Arc<str>);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepresentationKind {
    /// Large preview (preferred source for editing).
    Preview,
    Thumbnail,
}

/// Scheduling priority for (re)generating a representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Where a representation can be read from. The locator is meaningful only
/// to the store that issued it and may stop resolving at any time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RepresentationHandle {
    pub kind: RepresentationKind,
    pub locator: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetRepresentations {
    pub preview: Option<RepresentationHandle>,
    pub thumbnail: Option<RepresentationHandle>,
}

impl AssetRepresentations {
    /// Handles in load-preference order: preview first, thumbnail second.
    pub fn by_preference(&self) -> impl Iterator<Item = &RepresentationHandle> {
        self.preview.iter().chain(self.thumbnail.iter())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    /// The handle was valid once but its backing data is gone.
    #[error("representation handle revoked")]
    Revoked,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// The asset store the preview pipeline reads source pixels from.
pub trait AssetStore: Send + Sync {
    fn get(&self, id: &AssetId) -> Option<AssetRepresentations>;

    /// Encoded bytes behind a handle.
    fn read(&self, handle: &RepresentationHandle) -> Result<Vec<u8>, ReadError>;

    /// Ask the store to (re)generate a representation.
    fn request_generation(&self, id: &AssetId, kind: RepresentationKind, priority: Priority);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_preferred_over_thumbnail() {
        let reps = AssetRepresentations {
            preview: Some(RepresentationHandle {
                kind: RepresentationKind::Preview,
                locator: "p".into(),
            }),
            thumbnail: Some(RepresentationHandle {
                kind: RepresentationKind::Thumbnail,
                locator: "t".into(),
            }),
        };
        let order: Vec<_> = reps.by_preference().map(|h| h.kind).collect();
        assert_eq!(
            order,
            vec![RepresentationKind::Preview, RepresentationKind::Thumbnail]
        );
    }

    #[test]
    fn priority_orders_high_last() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
