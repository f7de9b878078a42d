//! # Byte Sinks
//!
//! Destinations for downloaded log bytes. The transfer session only needs a
//! seekable, writable stream; where the bytes land is up to the provider.

use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Seekable, writable byte stream receiving one log
pub trait ByteSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> ByteSink for T {}

/// Opens byte sinks by file name
pub trait SinkProvider {
    /// Create (or truncate) the sink named `filename`
    fn create(&mut self, filename: &str) -> io::Result<Box<dyn ByteSink>>;

    /// Size of an already existing sink named `filename`
    fn existing_size(&self, filename: &str) -> Option<u64>;
}

/// Writes logs as files under an output directory
#[derive(Debug, Clone)]
pub struct FileSinkProvider {
    dir: PathBuf,
}

impl FileSinkProvider {
    /// Create a provider rooted at `dir`
    ///
    /// The directory is created on first use if it does not exist.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Full path of `filename` under the output directory
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }
}

impl SinkProvider for FileSinkProvider {
    fn create(&mut self, filename: &str) -> io::Result<Box<dyn ByteSink>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(filename);
        debug!("Opening {} for writing", path.display());
        let file = File::create(path)?;
        Ok(Box::new(file))
    }

    fn existing_size(&self, filename: &str) -> Option<u64> {
        let metadata = fs::metadata(self.path_for(filename)).ok()?;
        metadata.is_file().then(|| metadata.len())
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::io::SeekFrom;
    use std::sync::{Arc, Mutex};

    /// In-memory sink provider for testing
    #[derive(Clone, Default)]
    pub struct MemorySinkProvider {
        pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub create_error: Arc<Mutex<Option<io::ErrorKind>>>,
        pub write_error: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl MemorySinkProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contents(&self, filename: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(filename).cloned()
        }

        pub fn insert(&self, filename: &str, data: Vec<u8>) {
            self.files.lock().unwrap().insert(filename.to_string(), data);
        }

        pub fn set_create_error(&self, error: io::ErrorKind) {
            *self.create_error.lock().unwrap() = Some(error);
        }

        pub fn set_write_error(&self, error: Option<io::ErrorKind>) {
            *self.write_error.lock().unwrap() = error;
        }
    }

    /// Writer over one entry of the shared file map
    pub struct MemorySink {
        name: String,
        pos: u64,
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        write_error: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl Write for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(error) = *self.write_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock write error"));
            }
            let mut files = self.files.lock().unwrap();
            let file = files.entry(self.name.clone()).or_default();
            let start = self.pos as usize;
            let end = start + buf.len();
            if file.len() < end {
                file.resize(end, 0);
            }
            file[start..end].copy_from_slice(buf);
            self.pos = end as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for MemorySink {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            let len = self
                .files
                .lock()
                .unwrap()
                .get(&self.name)
                .map_or(0, |f| f.len() as u64);
            self.pos = match pos {
                SeekFrom::Start(p) => p,
                SeekFrom::End(d) => (len as i64 + d) as u64,
                SeekFrom::Current(d) => (self.pos as i64 + d) as u64,
            };
            Ok(self.pos)
        }
    }

    impl SinkProvider for MemorySinkProvider {
        fn create(&mut self, filename: &str) -> io::Result<Box<dyn ByteSink>> {
            if let Some(error) = *self.create_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock create error"));
            }
            self.files.lock().unwrap().insert(filename.to_string(), Vec::new());
            Ok(Box::new(MemorySink {
                name: filename.to_string(),
                pos: 0,
                files: Arc::clone(&self.files),
                write_error: Arc::clone(&self.write_error),
            }))
        }

        fn existing_size(&self, filename: &str) -> Option<u64> {
            self.files.lock().unwrap().get(filename).map(|f| f.len() as u64)
        }
    }
}
