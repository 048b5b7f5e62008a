//! Directory-backed store.

use crate::{Closeable, Store};
use rsr_error::{RecoveryError, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A flat directory of named files.
///
/// File names must be a single path component. Every operation fails with
/// `ResourceClosed` once the store has been closed.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    closed: AtomicBool,
}

impl FsStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create (truncating) a file for writing.
    pub fn create(&self, name: &str) -> Result<File> {
        let path = self.path_for(name)?;
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?)
    }

    /// Open a file for reading.
    pub fn open_file(&self, name: &str) -> Result<File> {
        Ok(File::open(self.path_for(name)?)?)
    }

    pub fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        fs::write(self.path_for(name)?, bytes)?;
        Ok(())
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(name)?)?)
    }

    /// Atomically rename `from` to `to`, replacing `to` if it exists.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path_for(from)?, self.path_for(to)?)?;
        Ok(())
    }

    /// Sorted names of all regular files in the store.
    pub fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RecoveryError::resource_closed(self.root.display().to_string()));
        }
        Ok(())
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(RecoveryError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid store file name: {name:?}"),
            ))),
        }
    }
}

impl Closeable for FsStore {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target: "rsr::store", root = %self.root.display(), "fs_store_closed");
        }
        Ok(())
    }
}

impl Store for FsStore {
    fn delete_files(&self, names: &[String]) -> Result<()> {
        for name in names {
            match fs::remove_file(self.path_for(name)?) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefCountedResource;
    use std::io::Read;

    #[test]
    fn write_rename_list_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::open(dir.path().join("shard-0")).expect("open");
        store.write_file("recovery.1.0._0.cfs", b"chunk").expect("write");
        store.write_file("segments_1", b"commit").expect("write");
        store.rename("recovery.1.0._0.cfs", "_0.cfs").expect("rename");
        assert_eq!(
            store.list_files().expect("list"),
            vec!["_0.cfs".to_owned(), "segments_1".to_owned()]
        );
        assert_eq!(store.read_file("_0.cfs").expect("read"), b"chunk");
        let mut streamed = Vec::new();
        store
            .open_file("_0.cfs")
            .expect("open")
            .read_to_end(&mut streamed)
            .expect("read");
        assert_eq!(streamed, b"chunk");

        store
            .delete_files(&["_0.cfs".to_owned(), "missing".to_owned()])
            .expect("delete");
        assert_eq!(store.list_files().expect("list"), vec!["segments_1".to_owned()]);
    }

    #[test]
    fn rejects_names_escaping_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::open(dir.path()).expect("open");
        for bad in ["../etc", "a/b", "", "/abs"] {
            assert!(store.write_file(bad, b"x").is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn mark_for_close_waits_for_last_guard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = RefCountedResource::new("store", FsStore::open(dir.path()).expect("open"));
        let guard = resource.acquire().expect("acquire");
        guard.write_file("a", b"1").expect("write");
        resource.mark_for_close();
        assert!(!resource.is_closed());
        assert!(!guard.is_closed());
        assert_eq!(guard.read_file("a").expect("read"), b"1");
        drop(guard);
        assert!(resource.is_closed());
        assert!(resource.acquire().is_err());
    }

    #[test]
    fn closed_store_refuses_io_through_surviving_guard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = RefCountedResource::new("store", FsStore::open(dir.path()).expect("open"));
        let guard = resource.acquire().expect("acquire");
        guard.write_file("a", b"1").expect("write");

        guard.close().expect("close");
        assert!(guard.read_file("a").unwrap_err().is_programming_error());
        assert!(guard.open_file("a").is_err());
        assert!(guard.list_files().is_err());
        assert!(guard.delete_files(&["a".to_owned()]).is_err());
        assert!(dir.path().join("a").exists(), "closed store left files alone");
    }

    #[test]
    fn close_marks_store_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::open(dir.path()).expect("open");
        store.close().expect("close");
        assert!(store.is_closed());
        let err = store.read_file("a").unwrap_err();
        assert!(err.is_programming_error());
    }
}
