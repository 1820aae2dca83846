//! Mapping Verifier: checks a response belongs to the request that produced it.
//!
//! Two signals, both optional:
//! 1. Echoed id: must equal the originating item id when present.
//! 2. Echoed hash: must equal the fingerprint of the originating content when present.
//!
//! With neither signal present the mapping is accepted. An explicit mismatch
//! is never accepted.

use crate::pipeline::fingerprint::content_fingerprint;

use super::types::{MappingStatus, TrackableItem};

/// Why a mapping check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchReason {
    IdMismatch { expected: String, echoed: String },
    HashMismatch { expected: String, echoed: String },
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdMismatch { expected, echoed } => {
                write!(f, "echoed id {echoed:?} does not match request id {expected:?}")
            }
            Self::HashMismatch { expected, echoed } => {
                write!(f, "echoed hash {echoed:?} does not match content hash {expected:?}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MappingVerifier;

impl MappingVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Check the echoed id/hash against the originating item.
    pub fn check(
        &self,
        item: &TrackableItem,
        echoed_id: Option<&str>,
        echoed_hash: Option<&str>,
    ) -> Result<(), MismatchReason> {
        if let Some(echoed) = present(echoed_id) {
            let expected = item.id().to_string();
            if echoed != expected {
                return Err(MismatchReason::IdMismatch {
                    expected,
                    echoed: echoed.to_string(),
                });
            }
        }

        if let Some(echoed) = present(echoed_hash) {
            let expected = content_fingerprint(&item.source().bytes);
            if echoed != expected {
                return Err(MismatchReason::HashMismatch {
                    expected,
                    echoed: echoed.to_string(),
                });
            }
        }

        Ok(())
    }

    /// [`check`](Self::check) reduced to a mapping status, logging mismatches.
    pub fn verify(
        &self,
        item: &TrackableItem,
        echoed_id: Option<&str>,
        echoed_hash: Option<&str>,
    ) -> MappingStatus {
        match self.check(item, echoed_id, echoed_hash) {
            Ok(()) => {
                if present(echoed_id).is_none() && present(echoed_hash).is_none() {
                    tracing::debug!(item_id = %item.id(), "No mapping signal echoed, accepting");
                }
                MappingStatus::Verified
            }
            Err(reason) => {
                tracing::error!(
                    item_id = %item.id(),
                    file = item.file_name(),
                    reason = %reason,
                    "Response mapping mismatch"
                );
                MappingStatus::Mismatch
            }
        }
    }
}

/// Empty echoes count as absent.
fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::ImageSource;

    fn item() -> TrackableItem {
        TrackableItem::new(ImageSource::new("scan.png", "image/png", b"oct-bytes".to_vec()))
    }

    #[test]
    fn matching_id_verified() {
        let item = item();
        let id = item.id().to_string();
        assert_eq!(MappingVerifier.verify(&item, Some(&id), None), MappingStatus::Verified);
    }

    #[test]
    fn different_id_is_mismatch() {
        let item = item();
        let other = uuid::Uuid::new_v4().to_string();
        assert_eq!(MappingVerifier.verify(&item, Some(&other), None), MappingStatus::Mismatch);
        assert!(matches!(
            MappingVerifier.check(&item, Some(&other), None),
            Err(MismatchReason::IdMismatch { .. })
        ));
    }

    #[test]
    fn absent_signals_verified() {
        assert_eq!(MappingVerifier.verify(&item(), None, None), MappingStatus::Verified);
    }

    #[test]
    fn empty_echo_treated_as_absent() {
        assert_eq!(MappingVerifier.verify(&item(), Some(""), Some("")), MappingStatus::Verified);
    }

    #[test]
    fn matching_hash_verified() {
        let item = item();
        let hash = content_fingerprint(b"oct-bytes");
        assert_eq!(MappingVerifier.verify(&item, None, Some(&hash)), MappingStatus::Verified);
    }

    #[test]
    fn hash_mismatch_wins_over_matching_id() {
        let item = item();
        let id = item.id().to_string();
        let wrong = content_fingerprint(b"some other scan");
        assert_eq!(
            MappingVerifier.verify(&item, Some(&id), Some(&wrong)),
            MappingStatus::Mismatch
        );
        assert!(matches!(
            MappingVerifier.check(&item, Some(&id), Some(&wrong)),
            Err(MismatchReason::HashMismatch { .. })
        ));
    }

    #[test]
    fn id_comparison_is_exact() {
        let item = item();
        let padded = format!("{} ", item.id());
        assert_eq!(MappingVerifier.verify(&item, Some(&padded), None), MappingStatus::Mismatch);
    }
}
