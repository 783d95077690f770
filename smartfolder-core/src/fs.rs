use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

/// Minimal, async-capable filesystem abstraction used by the watcher, the
/// submission gate and the upload worker.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Check whether a path exists.
    async fn path_exists(&self, path: &Path) -> bool;

    /// List the direct children of a directory.
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Fetch lightweight file metadata.
    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata>;

    /// Read a whole file into memory.
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Delete a single regular file.
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Lightweight metadata needed by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    /// Last modified time if available
    pub modified: Option<SystemTime>,
}

impl FsMetadata {
    /// Modification time used by the submission ledger. Platforms without
    /// mtime support collapse to the epoch.
    pub fn modified_or_epoch(&self) -> SystemTime {
        self.modified.unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Real filesystem implementation backed by tokio::fs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for RealFs {
    async fn path_exists(&self, path: &Path) -> bool {
        // An entry we may not inspect is still there.
        match tokio::fs::try_exists(path).await {
            Ok(found) => found,
            Err(err) => err.kind() != io::ErrorKind::NotFound,
        }
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut rd = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            entries.push(entry.path());
        }
        Ok(entries)
    }

    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let md = tokio::fs::metadata(path).await?;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            modified: md.modified().ok(),
        })
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// In-memory filesystem for tests.
///
/// Paths are treated literally; callers should use consistent absolute paths.
/// Every mutation goes through `&self` so a shared `Arc<InMemoryFs>` can be
/// changed while the pipeline holds it.
#[derive(Debug, Default)]
pub struct InMemoryFs {
    nodes: RwLock<HashMap<PathBuf, Node>>,
}

#[derive(Debug, Clone)]
enum Node {
    Dir { children: Vec<PathBuf> },
    File { contents: Vec<u8>, modified: SystemTime },
}

/// Default mtime stamped on files created without an explicit one.
pub const IN_MEMORY_DEFAULT_MTIME: Duration = Duration::from_secs(1_000);

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut nodes = self.write_nodes();
        if nodes.contains_key(&path) {
            return;
        }
        ensure_parent_link(&mut nodes, &path);
        nodes.insert(
            path,
            Node::Dir {
                children: Vec::new(),
            },
        );
    }

    pub fn add_file<P: Into<PathBuf>>(&self, path: P, contents: &[u8]) {
        self.add_file_with_mtime(
            path,
            contents,
            SystemTime::UNIX_EPOCH + IN_MEMORY_DEFAULT_MTIME,
        );
    }

    pub fn add_file_with_mtime<P: Into<PathBuf>>(
        &self,
        path: P,
        contents: &[u8],
        modified: SystemTime,
    ) {
        let path = path.into();
        let mut nodes = self.write_nodes();
        ensure_parent_link(&mut nodes, &path);
        nodes.insert(
            path,
            Node::File {
                contents: contents.to_vec(),
                modified,
            },
        );
    }

    /// Change the mtime of an existing file. Returns false when the path is
    /// not a file.
    pub fn set_modified(&self, path: &Path, when: SystemTime) -> bool {
        let mut nodes = self.write_nodes();
        match nodes.get_mut(path) {
            Some(Node::File { modified, .. }) => {
                *modified = when;
                true
            }
            _ => false,
        }
    }

    /// Remove a file or a whole directory subtree.
    pub fn remove(&self, path: &Path) {
        let mut nodes = self.write_nodes();
        let mut stack = vec![path.to_path_buf()];
        while let Some(current) = stack.pop() {
            if let Some(Node::Dir { children }) = nodes.remove(&current) {
                stack.extend(children);
            }
        }
        if let Some(parent) = path.parent()
            && let Some(Node::Dir { children }) = nodes.get_mut(parent)
        {
            children.retain(|child| child != path);
        }
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Node>> {
        self.nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_parent_link(nodes: &mut HashMap<PathBuf, Node>, path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if parent.as_os_str().is_empty() {
        return;
    }
    if !nodes.contains_key(parent) {
        nodes.insert(
            parent.to_path_buf(),
            Node::Dir {
                children: Vec::new(),
            },
        );
        ensure_parent_link(nodes, parent);
    }
    if let Some(Node::Dir { children }) = nodes.get_mut(parent)
        && !children.iter().any(|p| p.as_path() == path)
    {
        children.push(path.to_path_buf());
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such path: {}", path.display()),
    )
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn path_exists(&self, path: &Path) -> bool {
        self.read_nodes().contains_key(path)
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        match self.read_nodes().get(path) {
            Some(Node::Dir { children }) => Ok(children.clone()),
            Some(Node::File { .. }) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read_dir on file: {}", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        match self.read_nodes().get(path) {
            Some(Node::Dir { .. }) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
                modified: None,
            }),
            Some(Node::File { contents, modified }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: contents.len() as u64,
                modified: Some(*modified),
            }),
            None => Err(not_found(path)),
        }
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.read_nodes().get(path) {
            Some(Node::File { contents, .. }) => Ok(contents.clone()),
            Some(Node::Dir { .. }) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read on directory: {}", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        let is_file = match self.read_nodes().get(path) {
            Some(Node::File { .. }) => true,
            Some(Node::Dir { .. }) => false,
            None => return Err(not_found(path)),
        };
        if !is_file {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("remove_file on directory: {}", path.display()),
            ));
        }
        self.remove(path);
        Ok(())
    }
}
