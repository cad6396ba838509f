//! Disk-backed unbounded buffering between a fast writer and a slow
//! reader.
use std::cell::RefCell;
use std::io::{self, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::chunk::Chunk;
use crate::config::{FileBufferOptions, StreamOptions};
use crate::context::Context;
use crate::conversion::Endpoint;
use crate::error::StreamError;
use crate::node::Node;
use crate::stage::{Done, Stage};

enum WriteFd {
    Opening,
    Open(File),
    /// Taken by an in-flight write
    Busy,
    Closed,
}

struct FileBufferState {
    path: PathBuf,
    remove_file: bool,
    read_buffer_size: usize,
    write_fd: WriteFd,
    /// A write that arrived before the file was open
    pending_write: Option<(Bytes, Done)>,
    writing: bool,
    read_fd: Option<File>,
    opening_read: bool,
    reading: bool,
    waiting_for_read: bool,
    total_written: u64,
    total_read: u64,
    write_eof: bool,
    eof_pushed: bool,
    cleaned_up: bool,
}

impl Drop for FileBufferState {
    fn drop(&mut self) {
        if !self.cleaned_up && self.remove_file {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "failed to remove file buffer");
                }
            }
        }
    }
}

type SharedState = Rc<RefCell<FileBufferState>>;

enum Next {
    Read,
    Open,
    Eof,
    Idle,
}

struct FileBufferStage {
    state: SharedState,
}

/// A duplex node buffering everything written to it in a file.
///
/// Writes are appended to the backing file as fast as they arrive; the
/// readable side replays the file at the consumer's pace. The file is
/// removed once everything has been read, or when the node is aborted
/// or dropped.
pub struct FileBufferStream {
    node: Node,
    path: PathBuf,
}

impl FileBufferStream {
    /// Buffer with the context's default options
    pub fn new(ctx: &Context) -> Self {
        Self::with_options(ctx, ctx.config().file_buffer.clone())
    }

    pub fn with_options(ctx: &Context, options: FileBufferOptions) -> Self {
        let path = options.resolve_path();
        let state = new_state(path.clone(), &options);
        let node = Node::duplex(
            ctx,
            StreamOptions::new().with_name("file-buffer"),
            FileBufferStage {
                state: Rc::clone(&state),
            },
        );
        open_for_writing(&node, state);
        FileBufferStream { node, path }
    }

    /// Backing file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }
}

impl From<FileBufferStream> for Node {
    fn from(stream: FileBufferStream) -> Self {
        stream.node
    }
}

impl From<FileBufferStream> for Endpoint {
    fn from(stream: FileBufferStream) -> Self {
        Endpoint::Native(stream.node)
    }
}

fn new_state(path: PathBuf, options: &FileBufferOptions) -> SharedState {
    Rc::new(RefCell::new(FileBufferState {
        path,
        remove_file: options.remove_file,
        read_buffer_size: options.read_buffer_size.max(1),
        write_fd: WriteFd::Opening,
        pending_write: None,
        writing: false,
        read_fd: None,
        opening_read: false,
        reading: false,
        waiting_for_read: false,
        total_written: 0,
        total_read: 0,
        write_eof: false,
        eof_pushed: false,
        cleaned_up: false,
    }))
}

fn open_for_writing(node: &Node, state: SharedState) {
    let weak = node.downgrade();
    let path = state.borrow().path.clone();
    node.context().spawn(async move {
        let result = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await;
        let Some(node) = weak.upgrade() else {
            return;
        };
        match result {
            Ok(file) => {
                let pending = {
                    let mut s = state.borrow_mut();
                    if s.cleaned_up {
                        drop(file);
                        let remove = s.remove_file;
                        drop(s);
                        if remove {
                            remove_backing_file(&node, path);
                        }
                        return;
                    }
                    if s.write_eof {
                        // input ended while opening; nothing will be written
                        drop(file);
                        return;
                    }
                    s.write_fd = WriteFd::Open(file);
                    s.pending_write.take()
                };
                debug!(node = %node, path = %path.display(), "file buffer opened");
                if let Some((data, done)) = pending {
                    start_write(&node, &state, data, done);
                }
            }
            Err(err) => {
                let pending = {
                    let mut s = state.borrow_mut();
                    s.write_fd = WriteFd::Closed;
                    s.pending_write.take()
                };
                let err = StreamError::from(err);
                match pending {
                    Some((_, done)) => done.fail(err),
                    None => node.emit_error(err),
                }
            }
        }
    });
}

impl Stage for FileBufferStage {
    fn name(&self) -> &str {
        "file-buffer"
    }

    fn write(&mut self, node: &Node, chunk: Chunk, done: Done) {
        let data = match chunk {
            Chunk::Data(bytes) => bytes,
            other => Bytes::from(other.to_text()),
        };
        let ready = {
            let mut guard = self.state.borrow_mut();
            let s = &mut *guard;
            if s.writing || s.pending_write.is_some() {
                panic!("Unexpected parallel writes to {}", s.path.display());
            }
            match s.write_fd {
                WriteFd::Opening => {
                    s.pending_write = Some((data, done));
                    return;
                }
                WriteFd::Open(_) => true,
                WriteFd::Busy | WriteFd::Closed => false,
            }
        };
        if ready {
            start_write(node, &self.state, data, done);
        } else {
            done.fail(closed_error());
        }
    }

    fn flush(&mut self, node: &Node, done: Done) {
        let wake = {
            let mut s = self.state.borrow_mut();
            s.write_eof = true;
            s.write_fd = WriteFd::Closed;
            !s.waiting_for_read
        };
        trace!(node = %node, "file buffer input ended");
        if wake {
            check_read_more(node, &self.state, None);
        }
        done.ok()
    }

    fn read(&mut self, node: &Node, size: usize) {
        self.state.borrow_mut().waiting_for_read = false;
        check_read_more(node, &self.state, Some(size));
    }

    fn abort(&mut self, node: &Node) {
        cleanup(node, &self.state);
    }
}

fn closed_error() -> StreamError {
    io::Error::new(io::ErrorKind::BrokenPipe, "file buffer is closed").into()
}

async fn write_all(file: &mut File, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let n = file.write(&data[offset..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "file buffer accepted no bytes",
            ));
        }
        offset += n;
    }
    file.flush().await
}

fn start_write(node: &Node, state: &SharedState, data: Bytes, done: Done) {
    let file = {
        let mut s = state.borrow_mut();
        match mem::replace(&mut s.write_fd, WriteFd::Busy) {
            WriteFd::Open(file) => {
                s.writing = true;
                file
            }
            other => {
                s.write_fd = other;
                drop(s);
                return done.fail(closed_error());
            }
        }
    };

    let ctx = node.context().clone();
    let node = node.clone();
    let state = Rc::clone(state);
    ctx.spawn(async move {
        let mut file = file;
        let result = write_all(&mut file, &data).await;
        let wake = {
            let mut s = state.borrow_mut();
            s.writing = false;
            if !s.cleaned_up && matches!(s.write_fd, WriteFd::Busy) {
                s.write_fd = WriteFd::Open(file);
            }
            if result.is_ok() {
                s.total_written += data.len() as u64;
            }
            result.is_ok() && !s.waiting_for_read
        };
        match result {
            Ok(()) => {
                if wake {
                    check_read_more(&node, &state, None);
                }
                done.ok()
            }
            Err(err) => {
                cleanup(&node, &state);
                done.fail(err.into())
            }
        }
    });
}

/// Decide what the read side should do next
fn check_read_more(node: &Node, state: &SharedState, size: Option<usize>) {
    let next = {
        let mut s = state.borrow_mut();
        if s.cleaned_up {
            Next::Idle
        } else if s.total_written > s.total_read {
            if s.read_fd.is_some() || s.reading {
                Next::Read
            } else if s.opening_read {
                Next::Idle
            } else {
                s.opening_read = true;
                Next::Open
            }
        } else if s.write_eof && !s.reading && !s.eof_pushed {
            s.eof_pushed = true;
            Next::Eof
        } else {
            Next::Idle
        }
    };
    match next {
        Next::Read => read_more(node, state, size),
        Next::Open => open_for_reading(node, state, size),
        Next::Eof => finish_reading(node, state),
        Next::Idle => {}
    }
}

fn open_for_reading(node: &Node, state: &SharedState, size: Option<usize>) {
    let ctx = node.context().clone();
    let node = node.clone();
    let state = Rc::clone(state);
    let path = state.borrow().path.clone();
    ctx.spawn(async move {
        let result = File::open(&path).await;
        let opened = {
            let mut s = state.borrow_mut();
            s.opening_read = false;
            match result {
                Ok(file) => {
                    if s.read_fd.is_some() {
                        panic!("Unexpected parallel opens of {}", path.display());
                    }
                    if !s.cleaned_up {
                        s.read_fd = Some(file);
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        match opened {
            Ok(()) => read_more(&node, &state, size),
            Err(err) => {
                cleanup(&node, &state);
                node.emit_error(err.into());
            }
        }
    });
}

async fn read_at(file: &mut File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size];
    let n = file.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

fn read_more(node: &Node, state: &SharedState, size: Option<usize>) {
    let (file, offset, want) = {
        let mut s = state.borrow_mut();
        if s.reading {
            return;
        }
        let Some(file) = s.read_fd.take() else {
            return;
        };
        s.reading = true;
        let want = size
            .filter(|&n| n > 0 && n <= s.read_buffer_size)
            .unwrap_or(s.read_buffer_size);
        (file, s.total_read, want)
    };

    let ctx = node.context().clone();
    let node = node.clone();
    let state = Rc::clone(state);
    ctx.spawn(async move {
        let mut file = file;
        let result = read_at(&mut file, offset, want).await;
        match result {
            Err(err) => {
                state.borrow_mut().reading = false;
                cleanup(&node, &state);
                node.emit_error(err.into());
            }
            Ok(buf) if buf.is_empty() => {
                // Caught up with the writer for now; reopen on the next wake.
                let recheck = {
                    let mut s = state.borrow_mut();
                    s.reading = false;
                    drop(file);
                    s.total_read < s.total_written || s.write_eof
                };
                if recheck {
                    let later = node.clone();
                    node.context()
                        .next_tick(move || check_read_more(&later, &state, None));
                }
            }
            Ok(buf) => {
                let read = buf.len();
                {
                    let mut s = state.borrow_mut();
                    s.reading = false;
                    s.total_read += read as u64;
                    if !s.cleaned_up {
                        s.read_fd = Some(file);
                    }
                }
                trace!(node = %node, bytes = read, "file buffer read");
                if node.push(Some(Chunk::Data(Bytes::from(buf)))) {
                    let remaining = size.filter(|&n| n > read).map(|n| n - read);
                    check_read_more(&node, &state, remaining);
                } else {
                    state.borrow_mut().waiting_for_read = true;
                }
            }
        }
    });
}

fn finish_reading(node: &Node, state: &SharedState) {
    debug!(node = %node, "file buffer drained");
    node.push(None);
    cleanup(node, state);
}

/// Close descriptors and remove the backing file; safe to call twice
fn cleanup(node: &Node, state: &SharedState) {
    let (path, remove) = {
        let mut s = state.borrow_mut();
        if s.cleaned_up {
            return;
        }
        s.cleaned_up = true;
        s.read_fd = None;
        if !matches!(s.write_fd, WriteFd::Opening) {
            s.write_fd = WriteFd::Closed;
        }
        (s.path.clone(), s.remove_file)
    };
    trace!(node = %node, path = %path.display(), "file buffer cleanup");
    if remove {
        remove_backing_file(node, path);
    }
}

fn remove_backing_file(node: &Node, path: PathBuf) {
    node.context().spawn(async move {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "file buffer removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file buffer"),
        }
    });
}
