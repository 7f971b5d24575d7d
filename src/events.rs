//! Filesystem change notifications for a single followed file.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::stream::Stream as FuturesStream;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Error;

/// What happened to the followed path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileEvent {
    /// The path now refers to a new file (created, or moved into place).
    Created,
    /// The file's data or metadata changed.
    Modified,
    /// The path no longer refers to the file (deleted, or moved away).
    Removed,
}

/// Watches the parent directory of a file and yields the events that concern
/// the file itself.
///
/// Watching the directory rather than the file keeps the watch valid across
/// deletion and re-creation, which is how most rotation schemes replace a
/// log file.
pub struct FileEvents {
    path: PathBuf,
    _watcher: notify::RecommendedWatcher,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileEvents")
            .field("path", &self.path)
            .finish()
    }
}

impl FileEvents {
    /// Starts watching `path`, which need not exist yet but whose parent
    /// directory must.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = absolutify(path)?;

        if path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            )
            .into());
        }

        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file needs a parent directory"))?
            .to_path_buf();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Only fails once the receiver is gone, at which point nobody is
            // interested in the event anyway.
            let _ = tx.send(res);
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        Ok(FileEvents {
            path,
            _watcher: watcher,
            event_stream: rx,
        })
    }

    /// The absolute path being followed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next event concerning the followed file.
    ///
    /// Returns `None` once the underlying watcher has shut down.
    pub async fn next_event(&mut self) -> Option<Result<FileEvent, Error>> {
        loop {
            match self.event_stream.recv().await? {
                Ok(event) => {
                    if let Some(kind) = classify(&self.path, &event) {
                        return Some(Ok(kind));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl FuturesStream for FileEvents {
    type Item = Result<FileEvent, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            let res = match self.event_stream.poll_recv(cx) {
                task::Poll::Pending => return task::Poll::Pending,
                task::Poll::Ready(None) => return task::Poll::Ready(None),
                task::Poll::Ready(Some(res)) => res,
            };

            match res {
                Ok(event) => {
                    if let Some(kind) = classify(&self.path, &event) {
                        return task::Poll::Ready(Some(Ok(kind)));
                    }
                }
                Err(e) => return task::Poll::Ready(Some(Err(e.into()))),
            }
        }
    }
}

fn classify(path: &Path, event: &notify::Event) -> Option<FileEvent> {
    let position = event.paths.iter().position(|p| p == path)?;

    let kind = match &event.kind {
        EventKind::Create(_) => FileEvent::Created,
        EventKind::Remove(_) => FileEvent::Removed,
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => FileEvent::Created,
            RenameMode::From => FileEvent::Removed,
            // `paths` is `[from, to]`
            RenameMode::Both if position == 0 => FileEvent::Removed,
            RenameMode::Both => FileEvent::Created,
            // Backends that can't tell which side of the rename we're on.
            _ => {
                if path.exists() {
                    FileEvent::Created
                } else {
                    FileEvent::Removed
                }
            }
        },
        EventKind::Modify(_) => FileEvent::Modified,
        // Windows reports some writes as `Any`
        EventKind::Any => FileEvent::Modified,
        EventKind::Access(_) | EventKind::Other => return None,
    };

    Some(kind)
}

/// Makes `path` absolute, resolving its parent directory through symlinks so
/// that it matches the paths `notify` reports.
fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let dir = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
        .to_os_string();

    let dir = dir.canonicalize().unwrap_or(dir);

    Ok(dir.join(filename))
}
