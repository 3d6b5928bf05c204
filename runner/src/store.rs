// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! File access for the concatenation step.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    io::{self, BufWriter, Read, Write},
    rc::Rc,
};

use camino::{Utf8Path, Utf8PathBuf};

/// Where fragments are read from and the combined artifact is written to.
pub trait ArtifactStore {
    type Fragment: Read;
    type Combined: Write;

    /// Opens a fragment for reading. Must fail if `path` does not name a
    /// readable file.
    fn open_fragment(&self, path: &Utf8Path) -> io::Result<Self::Fragment>;

    /// Creates the combined artifact, truncating any previous contents.
    fn create_combined(&self, path: &Utf8Path) -> io::Result<Self::Combined>;

    fn remove(&self, path: &Utf8Path) -> io::Result<()>;
}

/// The real filesystem. Relative paths are resolved against `root`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: Utf8PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `root` joined with `path`. Absolute paths are returned unchanged.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path)
    }
}

impl ArtifactStore for DiskStore {
    type Fragment = fs::File;
    type Combined = BufWriter<fs::File>;

    fn open_fragment(&self, path: &Utf8Path) -> io::Result<Self::Fragment> {
        let file = fs::File::open(self.resolve(path))?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{path} is a directory"),
            ));
        }
        Ok(file)
    }

    fn create_combined(&self, path: &Utf8Path) -> io::Result<Self::Combined> {
        fs::File::create(self.resolve(path)).map(BufWriter::new)
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }
}

type Files = Rc<RefCell<BTreeMap<Utf8PathBuf, Vec<u8>>>>;

/// An in-memory [`ArtifactStore`]. Clones share the same files, so a test can
/// keep one handle while the pipeline owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    files: Files,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<Utf8PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.borrow_mut().insert(path.into(), contents.into());
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        self.files.borrow().get(path.as_ref()).cloned()
    }

    pub fn contains(&self, path: impl AsRef<Utf8Path>) -> bool {
        self.files.borrow().contains_key(path.as_ref())
    }
}

/// Write handle into a [`MemoryStore`] file.
#[derive(Debug)]
pub struct MemoryFile {
    files: Files,
    path: Utf8PathBuf,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .borrow_mut()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ArtifactStore for MemoryStore {
    type Fragment = io::Cursor<Vec<u8>>;
    type Combined = MemoryFile;

    fn open_fragment(&self, path: &Utf8Path) -> io::Result<Self::Fragment> {
        self.get(path).map(io::Cursor::new).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{path} not found"))
        })
    }

    fn create_combined(&self, path: &Utf8Path) -> io::Result<Self::Combined> {
        self.files.borrow_mut().insert(path.to_path_buf(), Vec::new());
        Ok(MemoryFile {
            files: self.files.clone(),
            path: path.to_path_buf(),
        })
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        self.files.borrow_mut().remove(path).map(|_| ()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{path} not found"))
        })
    }
}

/// Which side of [`append`] failed.
#[derive(Debug)]
pub(crate) enum AppendError {
    Read(io::Error),
    Write(io::Error),
}

/// Copies all of `from` onto the end of `to`, byte for byte. Unlike
/// [`io::copy`], read and write failures are told apart.
pub(crate) fn append<R: Read, W: Write>(
    from: &mut R,
    to: &mut W,
) -> Result<u64, AppendError> {
    let mut buffer = [0u8; 8192];
    let mut written = 0;
    loop {
        let count = match from.read(&mut buffer) {
            Ok(0) => return Ok(written),
            Ok(count) => count,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                continue;
            }
            Err(error) => return Err(AppendError::Read(error)),
        };
        to.write_all(&buffer[..count]).map_err(AppendError::Write)?;
        written += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_truncates_on_create() -> io::Result<()> {
        let store = MemoryStore::new();
        store.insert("out.vhdl", "stale contents");

        let mut file = store.create_combined("out.vhdl".into())?;
        file.write_all(b"fresh")?;

        assert_eq!(store.get("out.vhdl").as_deref(), Some(&b"fresh"[..]));
        Ok(())
    }

    #[test]
    fn memory_store_reports_missing_fragments() {
        let store = MemoryStore::new();
        let error = store
            .open_fragment("missing.vhdl".into())
            .expect_err("nothing was inserted");
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn append_copies_everything() {
        let contents: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut to = b"head".to_vec();

        let written = append(&mut contents.as_slice(), &mut to)
            .expect("in-memory copy cannot fail");

        assert_eq!(written, contents.len() as u64);
        assert_eq!(&to[..4], b"head");
        assert_eq!(&to[4..], &contents[..]);
    }

    #[test]
    fn append_separates_read_and_write_failures() {
        struct Unreadable;
        impl Read for Unreadable {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("bad sector"))
            }
        }

        let mut full = [0u8; 2];
        let mut to = &mut full[..];

        assert!(matches!(
            append(&mut Unreadable, &mut Vec::new()),
            Err(AppendError::Read(_))
        ));
        assert!(matches!(
            append(&mut &b"too long"[..], &mut to),
            Err(AppendError::Write(_))
        ));
    }

    #[test]
    fn disk_store_resolves_against_root() {
        let store = DiskStore::new("/work/harness");
        assert_eq!(store.resolve("a.vhdl".into()), "/work/harness/a.vhdl");
        assert_eq!(store.resolve("/abs/b.vhdl".into()), "/abs/b.vhdl");
    }

    #[test]
    fn disk_store_refuses_directories_as_fragments() -> io::Result<()> {
        let directory = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(directory.path().to_path_buf())
            .map_err(|error| error.into_io_error())?;
        fs::create_dir(root.join("nested"))?;

        let store = DiskStore::new(root);
        assert!(store.open_fragment("nested".into()).is_err());
        Ok(())
    }
}
