//! Image reference store.
//!
//! The runner does not discover releases itself. It reads the built-in refs
//! once at start-up and then consumes a stream of "latest known" ref pairs.
//! Each item is the full desired pair, not a diff.

use std::pin::Pin;
use std::sync::Mutex;

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Stream of image ref updates.
pub type ImageRefStream = Pin<Box<dyn Stream<Item = ImageRefs> + Send>>;

/// Errors from the image store.
#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("latest image stream was already taken")]
    AlreadyTaken,

    #[error("image discovery is closed")]
    Closed,
}

/// Desired image refs for both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRefs {
    pub supervisor: String,
    pub updater: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_info: Option<ReleaseInfo>,
}

impl ImageRefs {
    pub fn new(supervisor: impl Into<String>, updater: impl Into<String>) -> Self {
        Self {
            supervisor: supervisor.into(),
            updater: updater.into(),
            release_info: None,
        }
    }

    pub fn with_release_info(mut self, release_info: ReleaseInfo) -> Self {
        self.release_info = Some(release_info);
        self
    }

    /// Release info as passed to containers through the environment.
    pub fn release_info_env(&self) -> String {
        self.release_info
            .as_ref()
            .map(ReleaseInfo::to_env_string)
            .unwrap_or_default()
    }

    /// Commit of the release, when known.
    pub fn commit(&self) -> Option<&str> {
        self.release_info
            .as_ref()
            .map(|info| info.manifest.release.commit.as_str())
    }
}

/// Metadata about the release the refs were discovered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    /// Content address of the release manifest.
    pub ipfs: String,
    pub manifest: ReleaseManifest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub release: Release,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub timestamp: String,
    pub repository: String,
    pub version: String,
    pub commit: String,
    pub services: ReleaseServices,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseServices {
    pub updater: String,
    pub supervisor: String,
}

impl ReleaseInfo {
    /// JSON form handed to containers.
    pub fn to_env_string(&self) -> String {
        // Serializing plain strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_env_string(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        serde_json::from_str(s).ok()
    }
}

/// Source of image refs.
pub trait ImageStore: Send + Sync {
    /// Refs built into this release. Always available.
    fn embedded_image_refs(&self) -> ImageRefs;

    /// Stream of latest refs. Can be taken only once.
    fn latest(&self) -> Result<ImageRefStream, ImageStoreError>;
}

/// Image store fed through an in-process channel.
///
/// Image discovery holds the [`ImageRefPublisher`]; the stream ends once
/// every publisher is dropped.
pub struct ChannelImageStore {
    embedded: ImageRefs,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ImageRefs>>>,
}

/// Sending side of a [`ChannelImageStore`].
#[derive(Clone)]
pub struct ImageRefPublisher {
    tx: mpsc::UnboundedSender<ImageRefs>,
}

impl ChannelImageStore {
    pub fn new(embedded: ImageRefs) -> (Self, ImageRefPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            embedded,
            receiver: Mutex::new(Some(rx)),
        };
        (store, ImageRefPublisher { tx })
    }

    /// Store whose stream starts with the embedded refs as the current latest.
    ///
    /// With no discovery source attached, this is what gets the supervisor
    /// launched once the updater is up.
    pub fn seeded(embedded: ImageRefs) -> (Self, ImageRefPublisher) {
        let (store, publisher) = Self::new(embedded.clone());
        // the receiver lives in `store`, so this send cannot fail
        let _ = publisher.publish(embedded);
        (store, publisher)
    }
}

impl ImageStore for ChannelImageStore {
    fn embedded_image_refs(&self) -> ImageRefs {
        self.embedded.clone()
    }

    fn latest(&self) -> Result<ImageRefStream, ImageStoreError> {
        let rx = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ImageStoreError::AlreadyTaken)?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

impl ImageRefPublisher {
    /// Announce a newly discovered ref pair.
    pub fn publish(&self, refs: ImageRefs) -> Result<(), ImageStoreError> {
        self.tx.send(refs).map_err(|_| ImageStoreError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    fn release(commit: &str) -> ReleaseInfo {
        ReleaseInfo {
            ipfs: "bafyrelease".to_string(),
            manifest: ReleaseManifest {
                release: Release {
                    commit: commit.to_string(),
                    version: "v1.2.3".to_string(),
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn test_release_info_env_string() {
        let refs = ImageRefs::new("sup:v1", "upd:v1").with_release_info(release("abc123"));
        let env = refs.release_info_env();
        assert!(env.contains("\"commit\":\"abc123\""));
        assert_eq!(ReleaseInfo::from_env_string(&env), refs.release_info);
        assert_eq!(refs.commit(), Some("abc123"));

        let bare = ImageRefs::new("sup:v1", "upd:v1");
        assert_eq!(bare.release_info_env(), "");
        assert_eq!(ReleaseInfo::from_env_string(""), None);
    }

    #[tokio::test]
    async fn test_channel_store_streams_in_order() {
        let (store, publisher) = ChannelImageStore::new(ImageRefs::new("sup:v0", "upd:v0"));
        assert_eq!(store.embedded_image_refs().supervisor, "sup:v0");

        let mut stream = store.latest().unwrap();
        publisher.publish(ImageRefs::new("sup:v1", "upd:v1")).unwrap();
        publisher.publish(ImageRefs::new("sup:v2", "upd:v1")).unwrap();
        drop(publisher);

        assert_eq!(stream.next().await.unwrap().supervisor, "sup:v1");
        assert_eq!(stream.next().await.unwrap().supervisor, "sup:v2");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_seeded_store_yields_embedded_refs_first() {
        let (store, publisher) = ChannelImageStore::seeded(ImageRefs::new("sup:v0", "upd:v0"));
        let mut stream = store.latest().unwrap();
        publisher.publish(ImageRefs::new("sup:v1", "upd:v1")).unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first, store.embedded_image_refs());
        assert_eq!(stream.next().await.unwrap().supervisor, "sup:v1");
    }

    #[test]
    fn test_latest_cannot_be_taken_twice() {
        let (store, _publisher) = ChannelImageStore::new(ImageRefs::new("sup", "upd"));
        assert!(store.latest().is_ok());
        assert!(matches!(store.latest(), Err(ImageStoreError::AlreadyTaken)));
    }
}
