//! Following a single growing file line by line.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::{FileEvent, FileEvents};
use crate::Line;

/// Identity of the file behind a path, used to notice that a path was
/// pointed at a different file between two checks.
#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

struct OpenFile {
    reader: BufReader<File>,
    id: Option<(u64, u64)>,
}

async fn open_at(path: &Path, seek_to_end: bool) -> io::Result<(OpenFile, u64)> {
    let mut file = File::open(path).await?;
    let meta = file.metadata().await?;
    let pos = if seek_to_end { meta.len() } else { 0 };
    if pos > 0 {
        file.seek(io::SeekFrom::Start(pos)).await?;
    }

    let open = OpenFile {
        reader: BufReader::new(file),
        id: file_id(&meta),
    };

    Ok((open, pos))
}

/// Produces every complete line appended to a file after it was opened.
///
/// Reading starts at the end of the file as it is at [`TailReader::open`];
/// existing content is never returned. A trailing line without its newline is
/// held back until the newline is written. The follower survives the file
/// being truncated (reading restarts at offset 0) and being removed and
/// re-created (the new file is read from the beginning).
///
/// Wakeups come from filesystem notifications, with a periodic re-check every
/// `poll_interval` for backends that drop or coalesce events.
pub struct TailReader {
    path: PathBuf,
    events: FileEvents,
    file: Option<OpenFile>,
    pos: u64,
    partial: Vec<u8>,
    // The path now names a different file; switch once the open one is drained.
    rotated: bool,
    poll_interval: Duration,
}

impl TailReader {
    /// Opens `path` positioned at its current end.
    ///
    /// Fails with [`Error::SourceUnavailable`] if the file can't be opened,
    /// or [`Error::Watch`] if change notifications can't be set up.
    pub async fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let path = path.into();

        // Watch before opening so nothing written in between goes unnoticed.
        let events = FileEvents::new(&path)?;
        let (file, pos) = open_at(events.path(), true)
            .await
            .map_err(|source| Error::SourceUnavailable {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), offset = pos, "following file");

        Ok(TailReader {
            path,
            events,
            file: Some(file),
            pos,
            partial: Vec::new(),
            rotated: false,
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next read in the current file.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Waits for the next complete line.
    ///
    /// Lines are returned without their `\n` (or `\r\n`) terminator, and may
    /// be empty. Returns `Ok(None)` if the change watcher shut down.
    pub async fn next_line(&mut self) -> Result<Option<Line>> {
        loop {
            if let Some(line) = self.read_line().await? {
                return Ok(Some(line));
            }

            if self.rotated {
                let last = self.take_partial();
                self.reopen().await?;
                match last {
                    Some(line) => return Ok(Some(line)),
                    None => continue,
                }
            }

            match timeout(self.poll_interval, self.events.next_event()).await {
                Err(_elapsed) => self.recheck().await?,
                Ok(None) => return Ok(None),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(event))) => self.handle_event(event).await?,
            }
        }
    }

    /// Turns the reader into a stream of lines. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Line>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn read_line(&mut self) -> Result<Option<Line>> {
        let open = match self.file.as_mut() {
            Some(open) => open,
            None => return Ok(None),
        };

        let n = open.reader.read_until(b'\n', &mut self.partial).await?;
        self.pos += n as u64;

        if self.partial.last() != Some(&b'\n') {
            // EOF, possibly in the middle of a line
            return Ok(None);
        }

        self.partial.pop();
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();

        Ok(Some(line.into()))
    }

    async fn handle_event(&mut self, event: FileEvent) -> Result<()> {
        trace!(path = %self.path.display(), ?event, "file event");

        match event {
            // The open handle still reads the old file; whatever replaces it
            // is picked up by identity on `Created` or the next re-check.
            FileEvent::Removed => {
                debug!(path = %self.path.display(), "file removed, waiting for it to reappear");
                Ok(())
            }
            FileEvent::Created if !self.has_identity() => {
                self.rotated = true;
                Ok(())
            }
            FileEvent::Created | FileEvent::Modified => self.recheck().await,
        }
    }

    fn has_identity(&self) -> bool {
        self.file.as_ref().is_some_and(|open| open.id.is_some())
    }

    /// Whatever is left of an unterminated line, as a line of its own.
    fn take_partial(&mut self) -> Option<Line> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line.into())
    }

    /// Compares the path on disk with the open file. A truncated file is
    /// reopened at once; a replaced one is switched to after the old handle
    /// has been read to its end.
    async fn recheck(&mut self) -> Result<()> {
        let meta = match metadata(self.events.path()).await {
            Ok(meta) => meta,
            // Gone for now; keep draining what is already open.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let replaced = match &self.file {
            None => true,
            Some(open) => open.id.is_some() && open.id != file_id(&meta),
        };

        if replaced {
            if !self.rotated {
                debug!(path = %self.path.display(), "file replaced, draining old file first");
            }
            self.rotated = true;
            Ok(())
        } else if meta.len() < self.pos {
            debug!(path = %self.path.display(), "file truncated, reading from start");
            self.reopen().await
        } else {
            Ok(())
        }
    }

    async fn reopen(&mut self) -> Result<()> {
        self.partial.clear();
        self.pos = 0;
        self.rotated = false;

        match open_at(self.events.path(), false).await {
            Ok((open, _)) => {
                self.file = Some(open);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.file = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::StreamExt;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    const POLL: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(2);

    async fn append(path: &Path, data: &[u8]) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(data).await.unwrap();
        file.sync_all().await.unwrap();
    }

    async fn next(reader: &mut TailReader) -> String {
        timeout(WAIT, reader.next_line())
            .await
            .expect("timed out waiting for line")
            .unwrap()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_starts_at_end_of_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"old 1\nold 2\n").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();
        assert_eq!(reader.position(), 12);

        append(&path, b"new\n").await;
        assert_eq!(next(&mut reader).await, "new");
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let res = TailReader::open(dir.path().join("nope.log"), POLL).await;
        assert!(matches!(res, Err(Error::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_blank_and_crlf_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();
        append(&path, b"a\n\n b\r\n").await;

        assert_eq!(next(&mut reader).await, "a");
        assert_eq!(next(&mut reader).await, "");
        assert_eq!(next(&mut reader).await, " b");
    }

    #[tokio::test]
    async fn test_partial_line_is_held_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();
        append(&path, b"foo ").await;
        assert!(timeout(Duration::from_millis(300), reader.next_line())
            .await
            .is_err());

        append(&path, b"bar\n").await;
        assert_eq!(next(&mut reader).await, "foo bar");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();
        append(&path, b"a rather long first line\n").await;
        assert_eq!(next(&mut reader).await, "a rather long first line");

        tokio::fs::write(&path, b"two\n").await.unwrap();
        assert_eq!(next(&mut reader).await, "two");
    }

    #[tokio::test]
    async fn test_follows_rename_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();
        append(&path, b"before\n").await;
        assert_eq!(next(&mut reader).await, "before");

        tokio::fs::rename(&path, dir.path().join("app.log.1"))
            .await
            .unwrap();
        append(&path, b"after\n").await;
        assert_eq!(next(&mut reader).await, "after");
    }

    async fn drain(reader: &mut TailReader) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = timeout(Duration::from_millis(800), reader.next_line()).await {
            lines.push(line.unwrap().unwrap().to_string());
        }
        lines
    }

    #[tokio::test]
    async fn test_rotation_behind_events_reads_each_line_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();

        // Everything happens before the reader looks, so it sees the
        // modify, rename and create events only after the new file exists.
        append(&path, b"before\n").await;
        tokio::fs::rename(&path, dir.path().join("app.log.1"))
            .await
            .unwrap();
        append(&path, b"after\n").await;

        assert_eq!(drain(&mut reader).await, ["before", "after"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_old_file_is_drained_before_switching() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let mut reader = TailReader::open(&path, POLL).await.unwrap();

        let mut old = OpenOptions::new().append(true).open(&path).await.unwrap();
        old.write_all(b"a\n").await.unwrap();
        tokio::fs::rename(&path, dir.path().join("app.log.1"))
            .await
            .unwrap();
        append(&path, b"b\n").await;

        // A writer still holding the old descriptor.
        old.write_all(b"late\nunterminated").await.unwrap();
        old.sync_all().await.unwrap();

        assert_eq!(
            drain(&mut reader).await,
            ["a", "late", "unterminated", "b"]
        );
    }

    #[tokio::test]
    async fn test_into_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"").await;

        let reader = TailReader::open(&path, POLL).await.unwrap();
        append(&path, b"one\ntwo\nthree\n").await;

        let lines = timeout(WAIT, reader.into_stream().take(3).collect::<Vec<_>>())
            .await
            .unwrap();
        let lines: Vec<String> = lines.into_iter().map(|l| l.unwrap().to_string()).collect();
        assert_eq!(lines, ["one", "two", "three"]);
    }
}
