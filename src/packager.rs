//! Chooses the response framing for a finished batch and produces its bytes.
//!
//! A single asset is served as-is. Two or more are bundled into a ZIP that is
//! written by a blocking producer into a bounded in-memory pipe: the consumer
//! starts receiving bytes as soon as the first entry is compressed, and memory
//! use stays flat regardless of how many or how large the entries are. The
//! archive uses data descriptors, so the writer never seeks back into bytes
//! that may already be on the wire.

use std::{
    cell::Cell,
    fs::File,
    io::{self, Read, Seek, Write},
    path::PathBuf,
    rc::Rc,
};

use tokio::{
    io::DuplexStream,
    sync::oneshot,
    task::{self, JoinHandle},
};
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};
use tracing::{debug, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::error::{Error, Result};
use crate::model::BatchResult;

pub const ARCHIVE_FILENAME: &str = "downloads.zip";
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

const COPY_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    Archive,
}

/// One file to add to the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Framing decision plus the byte source that realizes it.
#[derive(Debug)]
pub struct Package {
    pub framing: Framing,
    pub content_type: &'static str,
    pub filename: String,
    pub content_length: Option<u64>,
    pub source: ByteSource,
}

impl Package {
    /// Receiver that resolves once the archive producer has stopped touching
    /// workspace files. `None` for raw framing.
    pub fn take_producer_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        match &mut self.source {
            ByteSource::Archive(archive) => archive.done.take(),
            ByteSource::File(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum ByteSource {
    File(tokio::fs::File),
    Archive(ArchiveStream),
}

/// Read half of the archive pipe plus the handles that control the producer.
#[derive(Debug)]
pub struct ArchiveStream {
    pub reader: DuplexStream,
    pub task: JoinHandle<Result<u64>>,
    pub cancel: CancellationToken,
    done: Option<oneshot::Receiver<()>>,
}

#[derive(Debug, Clone)]
pub struct Packager {
    compression_level: u32,
    pipe_capacity: usize,
}

impl Default for Packager {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Packager {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes.max(1);
        self
    }

    pub async fn package(&self, result: &BatchResult) -> Result<Package> {
        match result.assets() {
            [] => Err(Error::NoAssets {
                failed: result.failures().len(),
            }),
            [asset] => {
                let file = tokio::fs::File::open(&asset.path).await?;
                let length = file.metadata().await?.len();
                Ok(Package {
                    framing: Framing::Raw,
                    content_type: RAW_CONTENT_TYPE,
                    filename: asset.file_name.clone(),
                    content_length: Some(length),
                    source: ByteSource::File(file),
                })
            }
            assets => {
                let entries = assets
                    .iter()
                    .map(|asset| ArchiveEntry {
                        path: asset.path.clone(),
                        name: asset.file_name.clone(),
                        size: asset.size,
                    })
                    .collect();
                Ok(Package {
                    framing: Framing::Archive,
                    content_type: ARCHIVE_CONTENT_TYPE,
                    filename: ARCHIVE_FILENAME.to_owned(),
                    content_length: None,
                    source: ByteSource::Archive(self.spawn_archive(entries)),
                })
            }
        }
    }

    /// Starts the producer. Must be called inside a Tokio runtime.
    fn spawn_archive(&self, entries: Vec<ArchiveEntry>) -> ArchiveStream {
        let (writer, reader) = tokio::io::duplex(self.pipe_capacity);
        let sink = SyncIoBridge::new(writer);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let level = self.compression_level;

        let task = task::spawn_blocking({
            let cancel = cancel.clone();
            move || {
                let _done = done_tx;
                let written = write_archive(sink, &entries, level, &cancel);
                match &written {
                    Ok(bytes) => debug!(entries = entries.len(), bytes, "archive finished"),
                    Err(err) => warn!(error = %err, "archive production stopped"),
                }
                written
            }
        });

        ArchiveStream {
            reader,
            task,
            cancel,
            done: Some(done_rx),
        }
    }
}

/// Writes `entries` as a deflated, streaming ZIP into `sink` and returns the
/// number of uncompressed bytes added. Stops with [`Error::Cancelled`] once
/// `cancel` fires.
///
/// On any error nothing more reaches `sink`: a partial archive never gets a
/// central directory appended behind the failure.
pub fn write_archive<W: Write>(
    sink: W,
    entries: &[ArchiveEntry],
    compression_level: u32,
    cancel: &CancellationToken,
) -> Result<u64> {
    let detached = Rc::new(Cell::new(false));
    let mut zip = ZipWriter::new_stream(DetachableSink {
        inner: sink,
        detached: Rc::clone(&detached),
    });

    match add_entries(&mut zip, entries, compression_level, cancel) {
        Ok(total) => {
            let mut sink = zip.finish()?;
            sink.flush()?;
            Ok(total)
        }
        Err(err) => {
            // The writer finalizes when dropped; that must not hit the wire.
            detached.set(true);
            drop(zip);
            Err(err)
        }
    }
}

fn add_entries<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    entries: &[ArchiveEntry],
    compression_level: u32,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut total = 0;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut file = File::open(&entry.path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(entry.size);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(compression_level)))
            .large_file(size >= u64::from(u32::MAX))
            .unix_permissions(0o644);

        zip.start_file(entry.name.as_str(), options)?;
        total += copy_entry(&mut file, zip, cancel)?;
    }
    Ok(total)
}

/// Forwards to `inner` until detached, then silently discards. A failed
/// write detaches it too, so a drop-time finalize neither reaches a broken
/// sink nor reports a second error.
struct DetachableSink<W> {
    inner: W,
    detached: Rc<Cell<bool>>,
}

impl<W: Write> Write for DetachableSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.detached.get() {
            return Ok(buf.len());
        }
        self.inner.write(buf).inspect_err(|_| self.detached.set(true))
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.detached.get() {
            return Ok(());
        }
        self.inner.flush().inspect_err(|_| self.detached.set(true))
    }
}

fn copy_entry<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(copied),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buf[..read])?;
        copied += read as u64;
    }
}
