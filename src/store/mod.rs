//! Directory-backed store of shared files.
//!
//! The directory is the only source of truth: listings read it afresh on every
//! call. Uploads are streamed into a hidden staging directory and only linked
//! into the store root once complete, so a listing never sees a partial file.
//! Storage names come from a [`NamingPolicy`] and are published without
//! overwriting, so unrelated uploads stream in parallel. Making files visible
//! (or removing them) and announcing the change happen together under a short
//! synchronous sequencer, which keeps the event order identical to the order
//! of the mutations on disk.

pub mod content_type;
mod error;
pub mod naming;
mod types;

pub use error::{StoreError, StoreResult};
pub use naming::NamingPolicy;
pub use types::{ChangeAction, ChangeEvent, StoredFile};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::notifier::{ChangeNotifier, Subscription};

/// Hidden directory inside the store root holding in-flight uploads.
pub const STAGING_DIR: &str = ".incoming";

/// Extension of staged upload files.
const STAGING_EXTENSION: &str = "part";

/// Default per-file upload ceiling (100 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Attempts at publishing a staged file before giving up on name collisions.
const PUBLISH_ATTEMPTS: usize = 8;

/// Options for opening a [`FileStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Largest accepted upload, per file.
    pub max_file_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// A file to add as part of [`FileStore::add_batch`].
pub struct NewFile<R> {
    pub display_name: String,
    pub content_type: String,
    pub content: R,
}

impl<R> NewFile<R> {
    pub fn new(display_name: impl Into<String>, content_type: impl Into<String>, content: R) -> Self {
        Self {
            display_name: display_name.into(),
            content_type: content_type.into(),
            content,
        }
    }
}

/// An open stored file ready to be transferred.
#[derive(Debug)]
pub struct Download {
    pub file: File,
    pub display_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// The shared file collection.
pub struct FileStore {
    root: PathBuf,
    staging: PathBuf,
    naming: NamingPolicy,
    notifier: Arc<ChangeNotifier>,
    options: StoreOptions,
    /// Held while a change is applied to the root and announced. Never held
    /// across an `.await`.
    sequencer: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// Staged uploads left behind by an earlier run are discarded.
    pub async fn open(
        root: impl Into<PathBuf>,
        options: StoreOptions,
        notifier: Arc<ChangeNotifier>,
    ) -> StoreResult<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);

        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StoreError::io("create store directory", &staging, e))?;

        let store = Self {
            root,
            staging,
            naming: NamingPolicy::new(),
            notifier,
            options,
            sequencer: Mutex::new(()),
        };
        store.purge_staging().await;

        info!(root = %store.root.display(), "file store opened");
        Ok(store)
    }

    async fn purge_staging(&self) {
        let Ok(mut entries) = fs::read_dir(&self.staging).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed stale staged upload"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale staged upload"),
            }
        }
    }

    /// Directory holding the stored files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.options.max_file_bytes
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Subscribe to changes committed to this store.
    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub(crate) fn path_of(&self, storage_name: &str) -> PathBuf {
        self.root.join(storage_name)
    }

    /// Every file currently in the store, read from disk at call time.
    ///
    /// Order is unspecified. Files deleted while the listing runs are skipped.
    pub async fn list(&self) -> StoreResult<Vec<StoredFile>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io("read store directory", &self.root, e))?;

        let mut files = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(StoreError::io("read store directory", &self.root, e)),
            };

            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!(path = %entry.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            if !naming::is_valid_storage_name(&name) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io("stat", entry.path(), e)),
            };
            if !metadata.is_file() {
                continue;
            }

            files.push(stored_file(&name, &metadata));
        }

        Ok(files)
    }

    /// Store one file and announce it.
    pub async fn add<R: AsyncRead + Send>(
        &self,
        display_name: &str,
        content_type: &str,
        content: R,
    ) -> StoreResult<StoredFile> {
        let mut batch = self.begin_batch();
        batch.stage(display_name, content_type, content).await?;
        let mut files = batch.commit().await?;
        files.pop().ok_or_else(|| StoreError::not_found(display_name))
    }

    /// Store several files, all or none.
    ///
    /// Every declared type is checked before anything is written. If any entry
    /// then fails, files already written for this batch are removed and no
    /// event is raised.
    pub async fn add_batch<R: AsyncRead + Send>(
        &self,
        entries: Vec<NewFile<R>>,
    ) -> StoreResult<Vec<StoredFile>> {
        if let Some(rejected) = entries
            .iter()
            .find(|entry| !content_type::is_allowed(&entry.content_type))
        {
            warn!(
                display_name = %rejected.display_name,
                content_type = %rejected.content_type,
                "batch rejected: file type not allowed"
            );
            return Err(StoreError::unsupported_type(&rejected.content_type));
        }

        let mut batch = self.begin_batch();
        for entry in entries {
            batch
                .stage(&entry.display_name, &entry.content_type, entry.content)
                .await?;
        }
        batch.commit().await
    }

    /// Start an incremental all-or-nothing upload.
    pub fn begin_batch(&self) -> UploadBatch<'_> {
        UploadBatch {
            store: self,
            staged: Vec::new(),
            in_flight: None,
        }
    }

    /// Delete a file and announce it.
    pub async fn remove(&self, storage_name: &str) -> StoreResult<()> {
        let path = self.checked_path(storage_name)?;
        match fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(StoreError::not_found(storage_name)),
            Err(e) => return Err(not_found_or_io(e, storage_name, "stat", &path)),
        }

        {
            let _sequenced = self.sequence();
            std::fs::remove_file(&path)
                .map_err(|e| not_found_or_io(e, storage_name, "delete", &path))?;
            self.notifier.publish(ChangeEvent::delete(storage_name));
        }

        info!(storage_name, "file removed");
        Ok(())
    }

    fn sequence(&self) -> MutexGuard<'_, ()> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a file for transfer.
    ///
    /// The returned handle stays readable even if the file is deleted while the
    /// transfer is running.
    pub async fn resolve_for_download(&self, storage_name: &str) -> StoreResult<Download> {
        let path = self.checked_path(storage_name)?;
        let file = File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, storage_name, "open", &path))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| StoreError::io("stat", &path, e))?;
        if !metadata.is_file() {
            return Err(StoreError::not_found(storage_name));
        }

        let display_name = naming::display_name_of(storage_name).to_string();
        Ok(Download {
            file,
            content_type: content_type::guess_from_name(&display_name),
            display_name,
            size_bytes: metadata.len(),
        })
    }

    fn checked_path(&self, storage_name: &str) -> StoreResult<PathBuf> {
        if naming::is_valid_storage_name(storage_name) {
            Ok(self.path_of(storage_name))
        } else {
            Err(StoreError::not_found(storage_name))
        }
    }

    /// Link a staged file into the store root under a name nobody holds yet.
    ///
    /// Runs under the sequencer, so it only uses blocking calls on a single
    /// directory entry.
    fn publish(&self, staged: &StagedFile) -> StoreResult<String> {
        let mut storage_name = staged.storage_name.clone();
        for _ in 0..PUBLISH_ATTEMPTS {
            let target = self.path_of(&storage_name);
            match std::fs::hard_link(&staged.temp_path, &target) {
                Ok(()) => return Ok(storage_name),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(storage_name = %storage_name, "storage name taken, picking another");
                    storage_name = self.naming.storage_name_for(&staged.display_name);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::io("publish", &staged.temp_path, e));
                }
                Err(e) => {
                    // Filesystems without hard links: names are unique by
                    // construction, so a checked rename is sufficient.
                    debug!(error = %e, "hard link unavailable, renaming instead");
                    if target.exists() {
                        storage_name = self.naming.storage_name_for(&staged.display_name);
                        continue;
                    }
                    std::fs::rename(&staged.temp_path, &target)
                        .map_err(|e| StoreError::io("publish", &target, e))?;
                    return Ok(storage_name);
                }
            }
        }
        Err(StoreError::io(
            "publish",
            self.path_of(&storage_name),
            std::io::Error::new(ErrorKind::AlreadyExists, "no free storage name"),
        ))
    }
}

fn stored_file(storage_name: &str, metadata: &std::fs::Metadata) -> StoredFile {
    let display_name = naming::display_name_of(storage_name);
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    StoredFile::new(
        storage_name,
        display_name,
        metadata.len(),
        modified_at,
        content_type::guess_from_name(display_name),
    )
}

fn not_found_or_io(
    error: std::io::Error,
    storage_name: &str,
    action: &'static str,
    path: &Path,
) -> StoreError {
    if error.kind() == ErrorKind::NotFound {
        StoreError::not_found(storage_name)
    } else {
        StoreError::io(action, path, error)
    }
}

/// A file written to the staging area, waiting for its batch to commit.
#[derive(Debug)]
struct StagedFile {
    temp_path: PathBuf,
    storage_name: String,
    display_name: String,
    size_bytes: u64,
    modified_at: DateTime<Utc>,
}

/// An upload in progress.
///
/// Files are validated and staged one at a time as they arrive; none becomes
/// visible until [`UploadBatch::commit`]. Dropping the batch without
/// committing (because an entry failed or the client went away) removes every
/// staged file.
pub struct UploadBatch<'a> {
    store: &'a FileStore,
    staged: Vec<StagedFile>,
    /// Staging file currently being written, if any.
    in_flight: Option<PathBuf>,
}

impl UploadBatch<'_> {
    /// Number of files staged so far.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Validate and stage one file.
    ///
    /// The type is checked before anything is written. Content is copied until
    /// it ends or crosses the size limit; on any failure the staged bytes are
    /// removed again. Returns the storage name the file will most likely
    /// receive.
    pub async fn stage<R: AsyncRead + Send>(
        &mut self,
        display_name: &str,
        content_type: &str,
        content: R,
    ) -> StoreResult<String> {
        if !content_type::is_allowed(content_type) {
            warn!(display_name, content_type, "upload rejected: file type not allowed");
            return Err(StoreError::unsupported_type(content_type));
        }

        let limit = self.store.options.max_file_bytes;

        let storage_name = self.store.naming.storage_name_for(display_name);
        let temp_path = self
            .store
            .staging
            .join(format!("{}.{}", storage_name, STAGING_EXTENSION));

        self.in_flight = Some(temp_path.clone());
        let written = write_limited(&temp_path, content, limit).await;
        self.in_flight = None;

        match written {
            Ok((size, modified_at)) => {
                debug!(storage_name = %storage_name, size, "upload staged");
                self.staged.push(StagedFile {
                    temp_path,
                    storage_name: storage_name.clone(),
                    display_name: naming::display_name_of(&storage_name).to_string(),
                    size_bytes: size,
                    modified_at,
                });
                Ok(storage_name)
            }
            Err(e) => {
                discard(&temp_path);
                warn!(display_name, error = %e, "upload failed");
                Err(e)
            }
        }
    }

    /// Make every staged file visible and announce them in one event.
    ///
    /// All links are made and the event is published under the store's
    /// sequencer, so a concurrent delete of a new file is always announced
    /// after its upload. If any link fails, the files already linked for this
    /// batch are removed before the sequencer is released and nothing is
    /// announced.
    pub async fn commit(mut self) -> StoreResult<Vec<StoredFile>> {
        let staged = std::mem::take(&mut self.staged);

        let published = {
            let sequenced = self.store.sequence();
            let mut published: Vec<String> = Vec::with_capacity(staged.len());
            for file in &staged {
                match self.store.publish(file) {
                    Ok(storage_name) => published.push(storage_name),
                    Err(e) => {
                        for name in &published {
                            discard(&self.store.path_of(name));
                        }
                        drop(sequenced);
                        for file in &staged {
                            discard(&file.temp_path);
                        }
                        warn!(error = %e, "batch commit failed, rolled back");
                        return Err(e);
                    }
                }
            }
            if !published.is_empty() {
                self.store
                    .notifier
                    .publish(ChangeEvent::upload(published.clone()));
            }
            published
        };

        for file in &staged {
            discard(&file.temp_path);
        }

        info!(count = published.len(), "files uploaded");
        Ok(staged
            .iter()
            .zip(published)
            .map(|(file, storage_name)| {
                let display_name = naming::display_name_of(&storage_name).to_string();
                StoredFile::new(
                    &storage_name,
                    &display_name,
                    file.size_bytes,
                    file.modified_at,
                    content_type::guess_from_name(&display_name),
                )
            })
            .collect())
    }
}

impl Drop for UploadBatch<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.in_flight.take() {
            discard(&path);
        }
        if !self.staged.is_empty() {
            debug!(count = self.staged.len(), "discarding uncommitted uploads");
        }
        for file in self.staged.drain(..) {
            discard(&file.temp_path);
        }
    }
}

/// Copy `content` into a new file at `path`, failing once more than `limit`
/// bytes arrive. Returns the size and modification time of the written file.
async fn write_limited<R: AsyncRead + Send>(
    path: &Path,
    content: R,
    limit: u64,
) -> StoreResult<(u64, DateTime<Utc>)> {
    let mut file = File::create(path)
        .await
        .map_err(|e| StoreError::io("create", path, e))?;

    let content = pin!(content);
    let mut limited = content.take(limit.saturating_add(1));
    let size = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(|e| StoreError::io("write", path, e))?;
    if size > limit {
        return Err(StoreError::payload_too_large(limit));
    }

    file.flush()
        .await
        .map_err(|e| StoreError::io("write", path, e))?;
    let modified_at = file
        .metadata()
        .await
        .and_then(|metadata| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((size, modified_at))
}

/// Best-effort synchronous removal, usable from `Drop`.
fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> FileStore {
        FileStore::open(
            dir.path(),
            StoreOptions::default(),
            Arc::new(ChangeNotifier::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("uploads");
        let store = FileStore::open(&root, StoreOptions::default(), Arc::default())
            .await
            .unwrap();
        assert!(root.join(STAGING_DIR).is_dir());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_purges_stale_staging_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STAGING_DIR)).unwrap();
        let stale = dir.path().join(STAGING_DIR).join("1-x.part");
        std::fs::write(&stale, b"half").unwrap();

        let _store = open_store(&dir).await;
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let file = store
            .add("notes.txt", "text/plain", &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(file.display_name, "notes.txt");
        assert_eq!(file.size_bytes, 5);
        assert_eq!(file.content_type, "text/plain");

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].storage_name, file.storage_name);
    }

    #[tokio::test]
    async fn test_list_ignores_hidden_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        std::fs::write(dir.path().join(".DS_Store"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("plain.txt"), b"x").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_name, "plain.txt");
    }

    #[tokio::test]
    async fn test_add_rejects_unsupported_type_without_writing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let err = store
            .add("virus.exe", "application/x-msdownload", &b"MZ"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedType { .. }));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_oversized_upload() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(
            dir.path(),
            StoreOptions { max_file_bytes: 4 },
            Arc::default(),
        )
        .await
        .unwrap();

        let err = store
            .add("big.bin", "application/octet-stream", &b"12345"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { limit: 4 }));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);

        // Exactly at the limit is fine.
        store
            .add("ok.bin", "application/octet-stream", &b"1234"[..])
            .await
            .unwrap();
    }

    /// Yields `ok_bytes` bytes, then fails like a dropped connection.
    struct BrokenReader {
        ok_bytes: usize,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.ok_bytes == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            let n = self.ok_bytes.min(buf.remaining()).min(1024);
            buf.put_slice(&vec![b'x'; n]);
            self.ok_bytes -= n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn staged_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count()
    }

    #[tokio::test]
    async fn test_read_error_mid_upload_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut sub = store.subscribe();

        let err = store
            .add("broken.bin", "application/octet-stream", BrokenReader { ok_bytes: 10_000 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(staged_count(&dir), 0);
        assert!(store.list().await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_read_error_discards_whole_batch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut sub = store.subscribe();

        let mut batch = store.begin_batch();
        batch.stage("ok.txt", "text/plain", &b"fine"[..]).await.unwrap();
        let err = batch
            .stage("broken.txt", "text/plain", BrokenReader { ok_bytes: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        drop(batch);

        assert_eq!(staged_count(&dir), 0);
        assert!(store.list().await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_failed_link_rolls_back_earlier_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut sub = store.subscribe();

        let mut batch = store.begin_batch();
        batch.stage("first.txt", "text/plain", &b"1"[..]).await.unwrap();
        batch.stage("second.txt", "text/plain", &b"2"[..]).await.unwrap();

        // Take away the second staged file so linking it fails.
        let mut staged: Vec<PathBuf> = std::fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        staged.sort();
        std::fs::remove_file(staged.last().unwrap()).unwrap();

        let err = batch.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(staged_count(&dir), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_batch_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        {
            let mut batch = store.begin_batch();
            batch
                .stage("a.txt", "text/plain", &b"a"[..])
                .await
                .unwrap();
            batch
                .stage("b.txt", "text/plain", &b"b"[..])
                .await
                .unwrap();
            assert_eq!(batch.len(), 2);
            assert!(store.list().await.unwrap().is_empty());
        }

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_commit_raises_single_event() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut sub = store.subscribe();

        let mut batch = store.begin_batch();
        batch.stage("a.txt", "text/plain", &b"a"[..]).await.unwrap();
        batch.stage("b.txt", "text/plain", &b"b"[..]).await.unwrap();
        let files = batch.commit().await.unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.action, ChangeAction::Upload);
        assert_eq!(event.affected.len(), 2);
        assert_eq!(event.affected[0], files[0].storage_name);
        assert_eq!(event.affected[1], files[1].storage_name);
        assert!(sub.try_recv().is_none());
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_twice_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let file = store.add("a.txt", "text/plain", &b"a"[..]).await.unwrap();

        store.remove(&file.storage_name).await.unwrap();
        let err = store.remove(&file.storage_name).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_rejects_path_escape() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        for name in ["../outside.txt", ".incoming", "", "a/b"] {
            let err = store.remove(name).await.unwrap_err();
            assert!(matches!(err, StoreError::NotFound { .. }), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn test_remove_refuses_directories() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let err = store.remove("folder").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(dir.path().join("folder").is_dir());
    }

    #[tokio::test]
    async fn test_added_file_matches_listing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let file = store
            .add("pic.png", "image/png", &b"\x89PNG"[..])
            .await
            .unwrap();
        assert!(file.is_image);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].storage_name, file.storage_name);
        assert_eq!(listed[0].size_bytes, file.size_bytes);
        assert_eq!(listed[0].content_type, file.content_type);
    }

    #[tokio::test]
    async fn test_resolve_for_download() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let file = store
            .add("report.pdf", "application/pdf", &b"%PDF-1.7"[..])
            .await
            .unwrap();

        let mut download = store.resolve_for_download(&file.storage_name).await.unwrap();
        assert_eq!(download.display_name, "report.pdf");
        assert_eq!(download.content_type, "application/pdf");
        assert_eq!(download.size_bytes, 8);

        let mut body = Vec::new();
        download.file.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_download_survives_concurrent_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let file = store.add("a.txt", "text/plain", &b"still here"[..]).await.unwrap();

        let mut download = store.resolve_for_download(&file.storage_name).await.unwrap();
        store.remove(&file.storage_name).await.unwrap();

        let mut body = Vec::new();
        let read = download.file.read_to_end(&mut body).await;
        // Unix keeps the inode alive; elsewhere the read may fail cleanly.
        if read.is_ok() {
            assert_eq!(body, b"still here");
        }
        assert!(store.list().await.unwrap().is_empty());
    }
}
