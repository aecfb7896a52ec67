//! Streaming ZIP of the whole store.
//!
//! The listing is snapshotted when a build starts. Entries are compressed on a
//! blocking thread and handed to the caller in chunks through a bounded
//! channel, so output starts flowing immediately and memory stays flat no
//! matter how large the store is. Files that disappear before their turn are
//! skipped; a receiver that goes away stops the build.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::store::{FileStore, StoreResult};

/// Suggested file name for the downloaded bundle.
pub const ARCHIVE_FILE_NAME: &str = "shared-files.zip";

/// Size of the chunks handed to the consumer.
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the compressor and the consumer.
const CHANNEL_DEPTH: usize = 4;

/// Entries at or above this size need ZIP64 records.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Byte chunks of an archive being built.
pub type ArchiveStream = ReceiverStream<io::Result<Vec<u8>>>;

/// Outcome of a finished build.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Entries written in full.
    pub written: usize,
    /// Files that vanished or could not be read.
    pub skipped: usize,
}

/// Builds ZIP bundles of a [`FileStore`].
#[derive(Clone)]
pub struct ArchiveBuilder {
    store: Arc<FileStore>,
}

struct Entry {
    path: PathBuf,
    name: String,
}

impl ArchiveBuilder {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    /// Start building an archive of every file currently stored.
    ///
    /// Fails only if the store cannot be listed; problems with individual
    /// files are logged and skipped.
    pub async fn build(&self) -> StoreResult<ArchiveStream> {
        let (stream, _report) = self.build_with_report().await?;
        Ok(stream)
    }

    /// Like [`ArchiveBuilder::build`], also returning a handle resolving to
    /// what was actually written.
    pub async fn build_with_report(
        &self,
    ) -> StoreResult<(ArchiveStream, tokio::task::JoinHandle<io::Result<ArchiveReport>>)> {
        let mut files = self.store.list().await?;
        files.sort_by(|a, b| a.storage_name.cmp(&b.storage_name));

        let mut used = HashSet::new();
        let entries: Vec<Entry> = files
            .iter()
            .map(|file| Entry {
                path: self.store.path_of(&file.storage_name),
                name: unique_entry_name(&file.display_name, &mut used),
            })
            .collect();

        debug!(entries = entries.len(), "archive snapshot taken");

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let report = tokio::task::spawn_blocking(move || {
            let sink = ChunkSender::new(tx.clone());
            let result = write_archive(sink, &entries);
            match &result {
                Ok(report) => info!(
                    written = report.written,
                    skipped = report.skipped,
                    "archive complete"
                ),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("archive receiver went away, stopping")
                }
                Err(e) => {
                    warn!(error = %e, "archive build failed");
                    let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                }
            }
            result
        });

        Ok((ReceiverStream::new(rx), report))
    }
}

fn write_archive(sink: ChunkSender, entries: &[Entry]) -> io::Result<ArchiveReport> {
    let closed = sink.closed_flag();
    let mut zip = ZipWriter::new_stream(sink);
    match write_entries(&mut zip, entries) {
        Ok(report) => {
            let mut sink = zip.finish().map_err(|e| {
                closed.store(true, Ordering::Release);
                zip_error(e)
            })?;
            sink.flush()?;
            Ok(report)
        }
        Err(e) => {
            // Dropping the writer finalizes it; nothing of that may reach the
            // consumer, or a truncated archive would look complete.
            closed.store(true, Ordering::Release);
            Err(e)
        }
    }
}

fn write_entries<W: Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    entries: &[Entry],
) -> io::Result<ArchiveReport> {
    let mut report = ArchiveReport::default();

    for entry in entries {
        let mut file = match std::fs::File::open(&entry.path) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %entry.path.display(), error = %e, "skipping file missing from archive");
                report.skipped += 1;
                continue;
            }
        };
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= ZIP64_THRESHOLD);
        zip.start_file(entry.name.as_str(), options)
            .map_err(zip_error)?;

        match io::copy(&mut file, zip) {
            Ok(_) => report.written += 1,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(e),
            Err(e) => {
                // The entry is truncated; keep going with the rest.
                warn!(path = %entry.path.display(), error = %e, "failed reading file into archive");
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

fn zip_error(error: zip::result::ZipError) -> io::Error {
    match error {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Pick an entry name not used yet: `a.txt`, `a (1).txt`, `a (2).txt`, ...
fn unique_entry_name(display_name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(display_name.to_string()) {
        return display_name.to_string();
    }

    let (stem, extension) = match display_name.rfind('.') {
        Some(dot) if dot > 0 => display_name.split_at(dot),
        _ => (display_name, ""),
    };
    (1..)
        .map(|n| format!("{} ({}){}", stem, n, extension))
        .find(|candidate| used.insert(candidate.clone()))
        .unwrap_or_else(|| display_name.to_string())
}

/// `Write` adapter forwarding fixed-size chunks into a channel.
///
/// Once closed (explicitly, or because the receiver went away) it swallows
/// all further output. Must only be used from a blocking context.
struct ChunkSender {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl ChunkSender {
    fn new(tx: mpsc::Sender<io::Result<Vec<u8>>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that closes the sender once set.
    fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.is_closed() {
            self.buf.clear();
            return Ok(());
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            self.closed.store(true, Ordering::Release);
            io::Error::new(io::ErrorKind::BrokenPipe, "archive receiver dropped")
        })
    }
}

impl Write for ChunkSender {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(data.len());
        }
        let room = CHUNK_SIZE - self.buf.len();
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for ChunkSender {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_entry_name() {
        let mut used = HashSet::new();
        assert_eq!(unique_entry_name("a.txt", &mut used), "a.txt");
        assert_eq!(unique_entry_name("a.txt", &mut used), "a (1).txt");
        assert_eq!(unique_entry_name("a.txt", &mut used), "a (2).txt");
        assert_eq!(unique_entry_name("README", &mut used), "README");
        assert_eq!(unique_entry_name("README", &mut used), "README (1)");
        assert_eq!(unique_entry_name(".env", &mut used), ".env");
        assert_eq!(unique_entry_name(".env", &mut used), ".env (1)");
    }

    #[test]
    fn test_unique_entry_name_avoids_existing_suffix() {
        let mut used = HashSet::new();
        unique_entry_name("a (1).txt", &mut used);
        unique_entry_name("a.txt", &mut used);
        assert_eq!(unique_entry_name("a.txt", &mut used), "a (2).txt");
    }

    #[tokio::test]
    async fn test_chunk_sender_splits_and_flushes() {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            let mut sender = ChunkSender::new(tx);
            sender.write_all(&vec![7u8; CHUNK_SIZE + 10]).unwrap();
            sender.flush().unwrap();
        })
        .await
        .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        assert_eq!(second.len(), 10);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_chunk_sender_reports_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tokio::task::spawn_blocking(move || {
            let mut sender = ChunkSender::new(tx);
            sender.write_all(&vec![0u8; CHUNK_SIZE])
        })
        .await
        .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_chunk_sender_swallows_writes_after_failed_send() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (first, second) = tokio::task::spawn_blocking(move || {
            let mut sender = ChunkSender::new(tx);
            let first = sender.write_all(&vec![0u8; CHUNK_SIZE]);
            let second = sender.write_all(&vec![0u8; CHUNK_SIZE]);
            (first, second.and_then(|_| sender.flush()))
        })
        .await
        .unwrap();
        assert!(first.is_err());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_archive_emits_no_trailer() {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || {
            let sender = ChunkSender::new(tx);
            let closed = sender.closed_flag();
            let mut zip = ZipWriter::new_stream(sender);
            zip.start_file("partial.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"half of an entry").unwrap();

            closed.store(true, Ordering::Release);
            // Finalizes on drop.
            drop(zip);
        })
        .await
        .unwrap();

        assert!(
            rx.recv().await.is_none(),
            "a closed sender must not forward the central directory"
        );
    }

    #[tokio::test]
    async fn test_write_archive_closes_sink_on_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"alpha").unwrap();
        let entries = vec![Entry {
            path,
            name: "a.txt".to_string(),
        }];

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tokio::task::spawn_blocking(move || {
            let sender = ChunkSender::new(tx);
            let closed = sender.closed_flag();
            (write_archive(sender, &entries), closed)
        })
        .await
        .unwrap();

        let (result, closed) = result;
        assert!(result.is_err());
        assert!(closed.load(Ordering::Acquire));
    }
}
