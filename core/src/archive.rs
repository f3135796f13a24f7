//! Flat block archive.
//!
//! An archive is a sequence of members, each a 512-byte text header followed by the member's
//! bytes padded with zeros to the next 512-byte boundary. Directories are stored as a header
//! whose name ends in `/` and carry no payload.
//!
//! ```text
//! offset  size  field
//!      0   100  name (NUL padded)
//!    100     8  permission bits, decimal text
//!    108     8  owner id, decimal text
//!    116     8  group id, decimal text
//!    124    12  size in bytes, decimal text
//!    136    12  modification time (reserved)
//!    148     8  checksum (reserved)
//!    156     1  type flag: '0' regular file, anything else directory
//!    157   100  linked file name (reserved)
//! ```

use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const BLOCK_SIZE: usize = 512;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const TYPE_FLAG: usize = 156;

const REGULAR_FILE: u8 = b'0';
const DIRECTORY: u8 = b'1';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub kind: EntryKind,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Size of the payload on disk, rounded up to whole blocks.
    pub fn padded_size(&self) -> u64 {
        padded(self.size)
    }
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

struct Header([u8; BLOCK_SIZE]);

impl Header {
    fn new(name: &str, size: u64, meta: &fs::Metadata, kind: EntryKind) -> Result<Self> {
        let mut block = [0u8; BLOCK_SIZE];
        write_field(&mut block[NAME], name, "name", name)?;
        write_field(&mut block[MODE], &permission_bits(meta).to_string(), "mode", name)?;
        let (uid, gid) = owner_ids(meta);
        write_field(&mut block[UID], &uid.to_string(), "owner id", name)?;
        write_field(&mut block[GID], &gid.to_string(), "group id", name)?;
        write_field(&mut block[SIZE], &size.to_string(), "size", name)?;
        block[TYPE_FLAG] = match kind {
            EntryKind::File => REGULAR_FILE,
            EntryKind::Directory => DIRECTORY,
        };
        Ok(Self(block))
    }

    fn parse(&self) -> Result<ArchiveEntry> {
        let name = field_text(&self.0[NAME]);
        let size = parse_number(&self.0[SIZE], "size", &name)?;
        let mode = parse_number(&self.0[MODE], "perms", &name)?;
        let kind = if self.0[TYPE_FLAG] == REGULAR_FILE {
            EntryKind::File
        } else {
            EntryKind::Directory
        };
        Ok(ArchiveEntry { name, size, mode, kind })
    }
}

fn write_field(field: &mut [u8], value: &str, what: &str, name: &str) -> Result<()> {
    // Room for the terminating NUL.
    if value.len() + 1 > field.len() {
        return Err(Error::Format(format!(
            "{} of `{}` does not fit in the header ({} bytes max)",
            what,
            name,
            field.len() - 1
        )));
    }
    field[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

fn field_text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_number<T: std::str::FromStr>(field: &[u8], what: &str, name: &str) -> Result<T> {
    field_text(field).trim().parse().map_err(|_| {
        Error::Format(format!("failed to extract {} of `{}` from the header", what, name))
    })
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

#[cfg(unix)]
fn owner_ids(meta: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn owner_ids(_meta: &fs::Metadata) -> (u32, u32) {
    (0, 0)
}

#[cfg(unix)]
fn set_permission_bits(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permission_bits(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)
}

/// Member name of `path` relative to `base`, always `/` separated.
fn member_name(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps a stored member name onto a relative path, refusing anything that would escape the
/// extraction directory.
fn member_path(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Format("empty member name".to_string()));
    }
    let path = Path::new(trimmed);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::Format(format!("unsafe member name `{}`", name)));
    }
    Ok(path.to_path_buf())
}

/// Reads one header block. `None` at a clean end of stream.
fn read_header<R: Read>(reader: &mut R) -> Result<Option<ArchiveEntry>> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match filled {
        0 => Ok(None),
        BLOCK_SIZE => Header(block).parse().map(Some),
        _ => Err(Error::Format(format!(
            "truncated header ({} of {} bytes)",
            filled, BLOCK_SIZE
        ))),
    }
}

/// A block archive backed by a file opened for reading and appending.
#[derive(Debug)]
pub struct Archive {
    file: File,
    path: PathBuf,
}

impl Archive {
    /// Opens the archive at `path`, creating an empty one if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a regular file, or a directory and everything below it. Member names are
    /// relative to the parent of `path`.
    pub fn append<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let root = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(path.display()));
            }
            Err(e) => return Err(e.into()),
        };
        // WalkDir follows a symlinked root, so it has to be refused here.
        if root.file_type().is_symlink() {
            return Err(Error::UnsupportedType {
                path: path.display().to_string(),
            });
        }

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let mut out = BufWriter::new(&self.file);

        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let meta = entry.metadata().map_err(io::Error::from)?;
            let name = member_name(entry.path(), base);

            if meta.is_file() {
                append_file(&mut out, entry.path(), &name, &meta)?;
            } else if meta.is_dir() {
                let header = Header::new(&format!("{}/", name), 0, &meta, EntryKind::Directory)?;
                out.write_all(&header.0)?;
                debug!(member = %name, "archived directory");
            } else {
                return Err(Error::UnsupportedType {
                    path: entry.path().display().to_string(),
                });
            }
        }

        out.flush()?;
        Ok(())
    }

    /// Pushes buffered data to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Lists all members from the start of the archive.
    pub fn list(&mut self) -> Result<Vec<ArchiveEntry>> {
        let len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_header(&mut reader)? {
            let start = reader.stream_position()?;
            if start + entry.size > len {
                return Err(Error::Format(format!(
                    "payload of `{}` is truncated ({} of {} bytes)",
                    entry.name,
                    len.saturating_sub(start),
                    entry.size
                )));
            }
            reader.seek_relative(entry.padded_size() as i64)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Extracts every member below `dir`, restoring stored permission bits.
    pub fn extract<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(0))?;

        // Directory modes are applied last so read-only directories can still be filled.
        let mut directories = Vec::new();

        while let Some(entry) = read_header(&mut reader)? {
            let target = dir.join(member_path(&entry.name)?);
            match entry.kind {
                EntryKind::Directory => {
                    fs::create_dir_all(&target)?;
                    reader.seek_relative(entry.padded_size() as i64)?;
                    directories.push((target, entry.mode));
                }
                EntryKind::File => {
                    extract_file(&mut reader, &target, &entry)?;
                    set_permission_bits(&target, entry.mode)?;
                }
            }
            debug!(member = %entry.name, size = entry.size, "extracted");
        }

        for (path, mode) in directories.into_iter().rev() {
            set_permission_bits(&path, mode)?;
        }
        Ok(())
    }
}

fn append_file<W: Write>(out: &mut W, path: &Path, name: &str, meta: &fs::Metadata) -> Result<()> {
    let size = meta.len();
    let header = Header::new(name, size, meta, EntryKind::File)?;
    out.write_all(&header.0)?;

    let file = File::open(path)?;
    let copied = io::copy(&mut BufReader::new(file).take(size), out)?;
    if copied != size {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} shrank while being archived", path.display()),
        )));
    }

    let padding = (padded(size) - size) as usize;
    out.write_all(&[0u8; BLOCK_SIZE][..padding])?;
    debug!(member = %name, size, "archived file");
    Ok(())
}

fn extract_file<R: Read>(reader: &mut R, target: &Path, entry: &ArchiveEntry) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(File::create(target)?);
    let copied = io::copy(&mut reader.by_ref().take(entry.size), &mut out)?;
    if copied != entry.size {
        return Err(Error::Format(format!(
            "payload of `{}` is truncated ({} of {} bytes)",
            entry.name, copied, entry.size
        )));
    }
    out.flush()?;

    let padding = entry.padded_size() - entry.size;
    io::copy(&mut reader.by_ref().take(padding), &mut io::sink())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    const TREE: &[&str] = &[
        "foo/",
        "foo/a/",
        "foo/a/t.txt",
        "foo/a/s.txt",
        "foo/b/",
        "foo/b/c/",
        "foo/b/c/e/",
        "foo/b/c/e/f/",
        "foo/b/c/e/f/g/",
        "foo/b/c/e/f/g/h.txt",
        "foo/d.txt",
        "foo/empty.txt",
    ];

    fn contents(name: &str) -> Vec<u8> {
        match name {
            "foo/a/t.txt" => b"hello world".to_vec(),
            "foo/a/s.txt" => "Rust is a systems programming language\n".repeat(10).into_bytes(),
            "foo/b/c/e/f/g/h.txt" => "Hello".repeat(5).into_bytes(),
            "foo/d.txt" => "block aligned".repeat(512).into_bytes(),
            _ => Vec::new(),
        }
    }

    fn create_tree(root: &Path) {
        for name in TREE {
            let path = root.join(name);
            if name.ends_with('/') {
                fs::create_dir_all(&path).unwrap();
            } else {
                fs::write(&path, contents(name)).unwrap();
            }
        }
    }

    #[test]
    fn test_append_list_extract() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        create_tree(src.path());

        let archive_path = work.path().join("foo.tar");
        {
            let mut archive = Archive::open(&archive_path).unwrap();
            archive.append(src.path().join("foo")).unwrap();
            archive.flush().unwrap();
        }

        let len = fs::metadata(&archive_path).unwrap().len();
        assert_eq!(len % BLOCK_SIZE as u64, 0);

        let mut archive = Archive::open(&archive_path).unwrap();
        let names: BTreeSet<String> = archive.list().unwrap().into_iter().map(|e| e.name).collect();
        let expected: BTreeSet<String> = TREE.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);

        archive.extract(dst.path()).unwrap();
        for name in TREE.iter().filter(|n| !n.ends_with('/')) {
            assert_eq!(fs::read(dst.path().join(name)).unwrap(), contents(name), "{name}");
        }
    }

    #[test]
    fn test_append_to_existing_archive() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        create_tree(src.path());
        fs::write(src.path().join("bar.txt"), b"second member").unwrap();

        let archive_path = work.path().join("foo.tar");
        Archive::open(&archive_path).unwrap().append(src.path().join("foo")).unwrap();
        Archive::open(&archive_path).unwrap().append(src.path().join("bar.txt")).unwrap();

        let entries = Archive::open(&archive_path).unwrap().list().unwrap();
        assert_eq!(entries.len(), TREE.len() + 1);
        let last = entries.last().unwrap();
        assert_eq!(last.name, "bar.txt");
        assert_eq!(last.size, 13);
        assert_eq!(last.kind, EntryKind::File);
    }

    #[test]
    fn test_list_is_restartable() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        create_tree(src.path());

        let mut archive = Archive::open(work.path().join("a.tar")).unwrap();
        archive.append(src.path().join("foo")).unwrap();
        let first = archive.list().unwrap();
        let second = archive.list().unwrap();
        assert_eq!(first, second);
        assert!(first[0].is_dir());
        assert_eq!(first[0].name, "foo/");
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let root = src.path().join("perms");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("script.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(root.join("readonly.txt"), b"ro").unwrap();
        set_permission_bits(&root.join("script.sh"), 0o750).unwrap();
        set_permission_bits(&root.join("readonly.txt"), 0o444).unwrap();
        set_permission_bits(&root, 0o555).unwrap();

        let mut archive = Archive::open(work.path().join("p.tar")).unwrap();
        archive.append(&root).unwrap();
        archive.extract(dst.path()).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&dst.path().join("perms/script.sh")), 0o750);
        assert_eq!(mode(&dst.path().join("perms/readonly.txt")), 0o444);
        assert_eq!(mode(&dst.path().join("perms")), 0o555);

        // Let TempDir clean up.
        set_permission_bits(&root, 0o755).unwrap();
        set_permission_bits(&dst.path().join("perms"), 0o755).unwrap();
    }

    #[test]
    fn test_missing_source() {
        let work = TempDir::new().unwrap();
        let mut archive = Archive::open(work.path().join("a.tar")).unwrap();
        let err = archive.append(work.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_unsupported() {
        let work = TempDir::new().unwrap();
        fs::write(work.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink(work.path().join("target"), work.path().join("link")).unwrap();

        let mut archive = Archive::open(work.path().join("a.tar")).unwrap();
        let err = archive.append(work.path().join("link")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType { .. }));
    }

    #[test]
    fn test_malformed_size_field() {
        let work = TempDir::new().unwrap();
        let path = work.path().join("bad.tar");
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"x.txt");
        block[MODE][..3].copy_from_slice(b"420");
        block[SIZE][..3].copy_from_slice(b"abc");
        block[TYPE_FLAG] = REGULAR_FILE;
        fs::write(&path, block).unwrap();

        let err = Archive::open(&path).unwrap().list().unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_truncated_header() {
        let work = TempDir::new().unwrap();
        let path = work.path().join("short.tar");
        fs::write(&path, [b'a'; 100]).unwrap();

        let err = Archive::open(&path).unwrap().list().unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_truncated_payload_fails_list() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        create_tree(src.path());
        let path = work.path().join("cut.tar");
        {
            let mut archive = Archive::open(&path).unwrap();
            archive.append(src.path().join("foo/d.txt")).unwrap();
            archive.flush().unwrap();
        }
        // Header plus part of the 6656-byte payload.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((BLOCK_SIZE + 1000) as u64).unwrap();
        drop(file);

        let err = Archive::open(&path).unwrap().list().unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        let dst = TempDir::new().unwrap();
        let err = Archive::open(&path).unwrap().extract(dst.path()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_escaping_member_rejected() {
        assert!(member_path("../etc/passwd").is_err());
        assert!(member_path("/abs").is_err());
        assert_eq!(member_path("foo/bar/").unwrap(), PathBuf::from("foo/bar"));
    }
}
