//! Static file streaming.
//!
//! [`FileStreamer`] sends a file as a sequence of 1024-byte body chunks,
//! reading the next chunk only after the previous one has been written, so
//! memory stays flat whatever the file size. Disk access goes through the
//! [`FileIo`] trait; [`BlockingFileIo`] runs it on a dedicated
//! [`WorkerPool`], apart from the handler pool and the event loop.
//!
//! Whatever happens after a successful open, the handle is closed exactly
//! once before [`FileStreamer::send_file`] returns.

use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::Error;
use crate::pool::WorkerPool;
use crate::response::Response;

pub const FILE_CHUNK_SIZE: usize = 1024;

pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// An open file, or anything else that reads like one.
pub struct FileHandle {
    path: PathBuf,
    reader: Option<Box<dyn Read + Send>>,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>, reader: impl Read + Send + 'static) -> Self {
        Self { path: path.into(), reader: Some(Box::new(reader)) }
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Blocking file access, performed off the event loop.
pub trait FileIo: Send + Sync + 'static {
    fn open(&self, path: PathBuf) -> IoFuture<'_, FileHandle>;

    /// Reads up to `size` bytes, short only at end of file. `None` at EOF.
    fn read_chunk<'a>(&'a self, handle: &'a mut FileHandle, size: usize) -> IoFuture<'a, Option<Bytes>>;

    fn close(&self, handle: FileHandle);
}

/// [`FileIo`] over `std::fs`, one blocking job per call.
#[derive(Clone, Debug)]
pub struct BlockingFileIo {
    pool: WorkerPool,
}

impl BlockingFileIo {
    pub fn new(threads: usize) -> Self {
        Self { pool: WorkerPool::new("file-io", threads) }
    }
}

fn pool_failed(_: Error) -> io::Error {
    io::Error::other("file I/O pool failure")
}

impl FileIo for BlockingFileIo {
    fn open(&self, path: PathBuf) -> IoFuture<'_, FileHandle> {
        Box::pin(async move {
            self.pool
                .run(move || {
                    let file = std::fs::File::open(&path)?;
                    if !file.metadata()?.is_file() {
                        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
                    }
                    Ok(FileHandle::new(path, file))
                })
                .await
                .map_err(pool_failed)?
        })
    }

    fn read_chunk<'a>(&'a self, handle: &'a mut FileHandle, size: usize) -> IoFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let mut reader = handle
                .reader
                .take()
                .ok_or_else(|| io::Error::other("file handle already closed"))?;
            let (reader, chunk) = self
                .pool
                .run(move || {
                    let chunk = read_up_to(reader.as_mut(), size);
                    (reader, chunk)
                })
                .await
                .map_err(pool_failed)?;
            handle.reader = Some(reader);
            chunk
        })
    }

    fn close(&self, handle: FileHandle) {
        debug!(path = %handle.path.display(), "closing file");
        drop(handle);
    }
}

/// Fills a chunk of `size` bytes unless EOF comes first.
pub(crate) fn read_up_to(reader: &mut dyn Read, size: usize) -> io::Result<Option<Bytes>> {
    let mut buf = BytesMut::zeroed(size);
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf.freeze()))
}

// ── Streamer ──────────────────────────────────────────────────────────────────

pub struct FileStreamer {
    io: Box<dyn FileIo>,
    chunk_size: usize,
}

impl FileStreamer {
    pub fn new(io: impl FileIo) -> Self {
        Self { io: Box::new(io), chunk_size: FILE_CHUNK_SIZE }
    }

    /// Opens `path`; any failure is reported as [`Error::FileNotFound`].
    pub async fn open_file(&self, path: &Path) -> Result<FileHandle, Error> {
        self.io.open(path.to_path_buf()).await.map_err(|e| {
            debug!(path = %path.display(), error = %e, "cannot open file");
            Error::FileNotFound(path.to_path_buf())
        })
    }

    /// Writes the file body chunk by chunk. Each chunk's write completes
    /// before the next read starts. Does not close the handle.
    pub async fn stream_file(&self, handle: &mut FileHandle, response: &mut Response) -> Result<(), Error> {
        loop {
            let chunk = match self.io.read_chunk(handle, self.chunk_size).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(path = %handle.path.display(), error = %e, "file read failed");
                    return Err(Error::FileResponse);
                }
            };
            response.flush_body(chunk).await?;
        }
    }

    /// Serves the file at `path` as a complete response.
    ///
    /// A missing file becomes a 404 error response. A read failure midway
    /// is appended as an error line and the response terminated. A
    /// transport failure aborts the response. The handle is closed on
    /// every path.
    pub async fn send_file(&self, path: &Path, response: &mut Response) -> Result<(), Error> {
        let mut handle = match self.open_file(path).await {
            Ok(handle) => handle,
            Err(e) => return response.send_error(&e).await,
        };

        let streamed = async {
            response.flush_header().await?;
            self.stream_file(&mut handle, response).await?;
            response.flush_end().await
        }
        .await;
        self.io.close(handle);

        match streamed {
            Ok(()) => Ok(()),
            Err(e @ Error::Transport(_)) => Err(e),
            Err(_) => response.send_error(&Error::FileResponse).await,
        }
    }
}

impl fmt::Debug for FileStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStreamer").field("chunk_size", &self.chunk_size).finish_non_exhaustive()
    }
}

/// `root` joined with the request path, or `None` if the path tries to
/// leave `root`.
pub fn resolve_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(uri_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}
