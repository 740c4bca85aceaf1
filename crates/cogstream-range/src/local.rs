//! Range reader over a local file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    BackendKind, RangeError, RangeReader, RangeReaderConfig, ReaderStatsSnapshot, Result,
    RetryPolicy, Telemetry,
};

/// Reads byte ranges from a file on the local filesystem.
///
/// The file handle is opened once and shared; reads serialize on it.
#[derive(Debug)]
pub struct LocalFileReader {
    path: PathBuf,
    location: String,
    file: Mutex<Option<File>>,
    length: u64,
    retry: RetryPolicy,
    telemetry: Telemetry,
    closed: AtomicBool,
}

impl LocalFileReader {
    /// Open `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(path, &RangeReaderConfig::default())
    }

    /// Open `path` using the retry settings from `config`.
    pub fn with_config<P: AsRef<Path>>(path: P, config: &RangeReaderConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let location = path.display().to_string();
        let file = File::open(&path).map_err(|e| RangeError::from_io(&location, e))?;
        let length = file
            .metadata()
            .map_err(|e| RangeError::from_io(&location, e))?
            .len();
        debug!(path = %location, length, "opened local file");

        Ok(Self {
            telemetry: Telemetry::new(BackendKind::File, location.clone()),
            path,
            location,
            file: Mutex::new(Some(file)),
            length,
            retry: RetryPolicy::from_config(&config.retry),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_once(&self, offset: u64, length: u32) -> Result<Bytes> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(RangeError::Closed)?;

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = BytesMut::zeroed(length as usize);
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RangeError::from_io(&self.location, e)),
            }
        }

        if filled < buf.len() {
            // The file may have been truncated underneath us.
            return Err(RangeError::ShortRead {
                offset,
                requested: length as u64,
                received: filled as u64,
            });
        }
        Ok(buf.freeze())
    }
}

impl RangeReader for LocalFileReader {
    fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        if offset + length as u64 > self.length {
            return Err(RangeError::UnexpectedEof {
                offset,
                requested: length as u64,
                available: self.length,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let bytes = self
            .retry
            .execute(&self.location, &self.closed, &self.telemetry, |_| {
                self.read_once(offset, length)
            })?;
        self.telemetry.bytes(bytes.len());
        Ok(bytes)
    }

    fn length(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        Ok(self.length)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.file.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn backend(&self) -> BackendKind {
        BackendKind::File
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn stats(&self) -> ReaderStatsSnapshot {
        self.telemetry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    fn temp_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_range() {
        let file = temp_file(4096);
        let reader = LocalFileReader::open(file.path()).unwrap();
        assert_eq!(reader.length().unwrap(), 4096);

        let bytes = reader.read_range(300, 4).unwrap();
        assert_eq!(&bytes[..], &[44, 45, 46, 47]);
        assert_eq!(reader.stats().bytes, 4);
    }

    #[test]
    fn test_missing_file_is_permanent() {
        let err = LocalFileReader::open("/definitely/not/here.tif").unwrap_err();
        assert!(matches!(err, RangeError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_past_end() {
        let file = temp_file(100);
        let reader = LocalFileReader::open(file.path()).unwrap();
        assert!(matches!(
            reader.read_range(96, 8),
            Err(RangeError::UnexpectedEof { available: 100, .. })
        ));
    }

    #[test]
    fn test_concurrent_reads() {
        let file = temp_file(8192);
        let reader = Arc::new(LocalFileReader::open(file.path()).unwrap());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    let offset = i * 1000;
                    let bytes = reader.read_range(offset, 16).unwrap();
                    assert_eq!(bytes[0], (offset % 256) as u8);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_close() {
        let file = temp_file(10);
        let reader = LocalFileReader::open(file.path()).unwrap();
        reader.close();
        assert!(matches!(reader.read_range(0, 1), Err(RangeError::Closed)));
    }
}
