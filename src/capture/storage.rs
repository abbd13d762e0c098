//! Per-frame files on local storage.
//!
//! Layout: `{capture_dir}/{session}-{timestamp_ms}.{ext}`. No manifest; frames
//! are ordered by timestamp.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::capture::frame::{Frame, PixelFormat};

/// Longest session name kept in filenames, in bytes.
pub const MAX_SESSION_LEN: usize = 31;

pub const DEFAULT_SESSION: &str = "session";

/// Clamp a session name to [`MAX_SESSION_LEN`] bytes on a char boundary and
/// replace characters that would escape the capture directory.
///
/// Never fails: over-long input is silently truncated, empty input becomes
/// [`DEFAULT_SESSION`].
pub fn sanitize_session(raw: &str) -> String {
    let mut out = String::with_capacity(MAX_SESSION_LEN);
    for c in raw.trim().chars() {
        let c = match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if out.len() + c.len_utf8() > MAX_SESSION_LEN {
            break;
        }
        out.push(c);
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        return DEFAULT_SESSION.to_string();
    }
    out
}

/// Writes captured frames into one directory.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the capture directory if missing. Fails if the path exists but is
    /// not a directory.
    pub fn ensure_dir(&self) -> io::Result<()> {
        match fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is not a directory", self.dir.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Creating capture directory {}", self.dir.display());
                fs::create_dir_all(&self.dir)
            }
            Err(e) => Err(e),
        }
    }

    pub fn frame_path(&self, session: &str, timestamp_ms: i64, format: PixelFormat) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{}",
            session,
            timestamp_ms,
            format.extension()
        ))
    }

    /// Write one frame's buffer to its file.
    pub fn write_frame(&self, session: &str, timestamp_ms: i64, frame: &Frame) -> io::Result<PathBuf> {
        let path = self.frame_path(session, timestamp_ms, frame.meta.format);
        fs::write(&path, &frame.data)?;
        Ok(path)
    }
}

/// Hands out strictly increasing millisecond timestamps for one sequence, so
/// two frames landing in the same millisecond never share a filename.
#[derive(Debug, Default)]
pub struct TimestampSequence {
    last: Option<i64>,
}

impl TimestampSequence {
    pub fn next(&mut self, now_ms: i64) -> i64 {
        let ts = match self.last {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last = Some(ts);
        ts
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn long_session_is_truncated_not_rejected() {
        let long = "a".repeat(200);
        let s = sanitize_session(&long);
        assert_eq!(s.len(), MAX_SESSION_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; 16 of them are 32 bytes.
        let s = sanitize_session(&"é".repeat(16));
        assert!(s.len() <= MAX_SESSION_LEN);
        assert_eq!(s.chars().count(), 15);
    }

    #[test]
    fn separators_cannot_escape_directory() {
        assert_eq!(sanitize_session("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_session(".."), DEFAULT_SESSION);
        assert_eq!(sanitize_session("   "), DEFAULT_SESSION);
    }

    #[test]
    fn path_layout() {
        let store = FrameStore::new("/data/capture");
        assert_eq!(
            store.frame_path("rig", 12_345, PixelFormat::Grayscale),
            PathBuf::from("/data/capture/rig-12345.gray")
        );
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut seq = TimestampSequence::default();
        assert_eq!(seq.next(100), 100);
        assert_eq!(seq.next(100), 101);
        assert_eq!(seq.next(100), 102);
        assert_eq!(seq.next(250), 250);
        assert_eq!(seq.last(), Some(250));
    }

    #[test]
    fn writes_frame_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::new(dir.path().join("capture"));
        store.ensure_dir().unwrap();
        store.ensure_dir().unwrap();

        let frame = Frame {
            data: Bytes::from_static(b"\xFF\xD8payload\xFF\xD9"),
            meta: Arc::new(FrameMetadata {
                sequence: 1,
                width: 320,
                height: 240,
                format: PixelFormat::Jpeg,
            }),
            timestamp: Instant::now(),
        };
        let path = store.write_frame("s1", 42, &frame).unwrap();
        assert!(path.ends_with("s1-42.jpg"));
        assert_eq!(fs::read(path).unwrap(), frame.data.to_vec());
    }

    #[test]
    fn ensure_dir_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(FrameStore::new(&file).ensure_dir().is_err());
    }
}
