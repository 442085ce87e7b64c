//! Transport abstraction for moving sealed packages between nodes.
//!
//! A transport is a flat folder of named files. Package and ticket names
//! follow the [`PackageName`] grammar, so listing with a [`FileMask`] is
//! all a node needs to find what is addressed to it.

use async_trait::async_trait;

use courier_core::{NodeId, PackageKind, PackageName};

use crate::error::SyncError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Transport trait for listing, uploading and downloading package files.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// File names matching `mask`, sorted.
    async fn list(&self, mask: &FileMask) -> Result<Vec<String>>;

    /// Store `bytes` under `name`, replacing any previous file.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fetch a file.
    async fn download(&self, name: &str) -> Result<Vec<u8>>;

    /// Remove a file. Removing a missing file is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Filter over file names. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMask {
    pub application: Option<String>,
    pub sender: Option<NodeId>,
    /// Matches packages addressed to this node, including `AllNodes`.
    pub recipient: Option<NodeId>,
    pub kind: Option<PackageKind>,
    pub extension: Option<String>,
}

impl FileMask {
    /// Everything of `application` with extension `ext`.
    pub fn new(application: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            application: Some(application.into()),
            extension: Some(ext.into()),
            ..Self::default()
        }
    }

    /// Only packages addressed to `node` or to all nodes.
    pub fn to(mut self, node: &NodeId) -> Self {
        self.recipient = Some(node.clone());
        self
    }

    /// Only packages sent by `node`.
    pub fn from(mut self, node: &NodeId) -> Self {
        self.sender = Some(node.clone());
        self
    }

    /// Only packages of `kind`.
    pub fn kind(mut self, kind: PackageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Whether `file_name` matches. Names that do not parse never match.
    pub fn matches(&self, file_name: &str) -> bool {
        if let Some(ext) = &self.extension {
            match file_name.rsplit_once('.') {
                Some((_, e)) if e == ext => {}
                _ => return false,
            }
        }
        let Ok(name) = PackageName::parse(file_name) else {
            return false;
        };
        if self.application.as_ref().is_some_and(|a| *a != name.application) {
            return false;
        }
        if self.sender.as_ref().is_some_and(|s| *s != name.sender) {
            return false;
        }
        if let Some(node) = &self.recipient {
            // A node never receives its own broadcasts.
            if !name.recipient.includes(node) || name.sender == *node {
                return false;
            }
        }
        if self.kind.is_some_and(|k| k != name.kind) {
            return false;
        }
        true
    }
}

/// A shared in-memory folder for tests and single-process meshes.
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory transport. Clones share the same folder.
    #[derive(Clone, Default)]
    pub struct MemoryTransport {
        files: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    }

    impl MemoryTransport {
        /// Empty transport.
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of files currently in the folder.
        pub async fn len(&self) -> usize {
            self.files.read().await.len()
        }

        /// Whether no file is stored.
        pub async fn is_empty(&self) -> bool {
            self.files.read().await.is_empty()
        }

        /// All file names, regardless of grammar.
        pub async fn names(&self) -> Vec<String> {
            self.files.read().await.keys().cloned().collect()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn list(&self, mask: &FileMask) -> Result<Vec<String>> {
            let files = self.files.read().await;
            Ok(files.keys().filter(|n| mask.matches(n)).cloned().collect())
        }

        async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
            self.files.write().await.insert(name.to_string(), bytes);
            Ok(())
        }

        async fn download(&self, name: &str) -> Result<Vec<u8>> {
            let files = self.files.read().await;
            files
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::TransportError(format!("file not found: {name}")))
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.files.write().await.remove(name);
            Ok(())
        }
    }
}

/// A directory on a local or mounted file system.
pub mod folder {
    use super::*;
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};

    /// Transport over a shared directory.
    pub struct FolderTransport {
        root: PathBuf,
    }

    impl FolderTransport {
        /// Use `root`, creating it if needed.
        pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
            let root = root.as_ref().to_path_buf();
            tokio::fs::create_dir_all(&root).await?;
            Ok(Self { root })
        }

        /// The shared directory.
        pub fn root(&self) -> &Path {
            &self.root
        }

        pub(super) fn path(&self, name: &str) -> Result<PathBuf> {
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(SyncError::TransportError(format!("invalid file name {name:?}")));
            }
            Ok(self.root.join(name))
        }
    }

    #[async_trait]
    impl Transport for FolderTransport {
        async fn list(&self, mask: &FileMask) -> Result<Vec<String>> {
            let mut names = Vec::new();
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if mask.matches(name) {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        }

        async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
            let path = self.path(name)?;
            // Write under a hidden name first so readers never see a partial file.
            let partial = self.root.join(format!(".{name}.partial"));
            tokio::fs::write(&partial, bytes).await?;
            tokio::fs::rename(&partial, &path).await?;
            Ok(())
        }

        async fn download(&self, name: &str) -> Result<Vec<u8>> {
            let path = self.path(name)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(SyncError::TransportError(format!("file not found: {name}")))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn delete(&self, name: &str) -> Result<()> {
            let path = self.path(name)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::folder::FolderTransport;
    use super::memory::MemoryTransport;
    use super::*;
    use courier_core::Recipient;

    fn file(sender: &str, recipient: Recipient, seq: u64) -> String {
        PackageName::new("App", NodeId::new(sender), recipient, seq, PackageKind::Protocol)
            .unwrap()
            .file_name("pkg")
    }

    #[test]
    fn test_mask_recipient_includes_broadcasts() {
        let b = NodeId::new("B");
        let mask = FileMask::new("App", "pkg").to(&b);

        assert!(mask.matches(&file("A", Recipient::AllNodes, 1)));
        assert!(mask.matches(&file("A", Recipient::Node(b.clone()), 1)));
        assert!(!mask.matches(&file("A", Recipient::Node(NodeId::new("C")), 1)));
        assert!(!mask.matches(&file("B", Recipient::AllNodes, 1)));
    }

    #[test]
    fn test_mask_extension_and_garbage() {
        let mask = FileMask::new("App", "pkg");
        assert!(!mask.matches("App-A-AllNodes-00000001-Protocol.tkt"));
        assert!(!mask.matches("notes.pkg"));
        assert!(!FileMask::new("Other", "pkg").matches(&file("A", Recipient::AllNodes, 1)));
    }

    #[tokio::test]
    async fn test_memory_transport_shared_folder() {
        let a = MemoryTransport::new();
        let b = a.clone();
        let name = file("A", Recipient::AllNodes, 1);

        a.upload(&name, vec![1, 2, 3]).await.unwrap();
        let listed = b
            .list(&FileMask::new("App", "pkg").to(&NodeId::new("B")))
            .await
            .unwrap();
        assert_eq!(listed, vec![name.clone()]);
        assert_eq!(b.download(&name).await.unwrap(), vec![1, 2, 3]);

        b.delete(&name).await.unwrap();
        assert!(a.is_empty().await);
        assert!(a.download(&name).await.is_err());
    }

    #[tokio::test]
    async fn test_folder_transport_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FolderTransport::open(dir.path().join("share")).await.unwrap();
        let first = file("A", Recipient::AllNodes, 2);
        let second = file("A", Recipient::AllNodes, 1);

        transport.upload(&first, b"two".to_vec()).await.unwrap();
        transport.upload(&second, b"one".to_vec()).await.unwrap();
        let listed = transport.list(&FileMask::new("App", "pkg")).await.unwrap();
        assert_eq!(listed, vec![second.clone(), first.clone()]);
        assert_eq!(transport.download(&second).await.unwrap(), b"one");

        transport.delete(&second).await.unwrap();
        transport.delete(&second).await.unwrap();
        assert!(transport.path("../escape").is_err());
    }
}
