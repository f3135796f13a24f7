//! Blocking codec pipelines: source to staged artifact, and artifact back to files.
//!
//! Every stage writes a fresh temp file; the previous stage's temp is removed as soon as the
//! next one is done.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use vaultkeep_backends::copy_tree;
use vaultkeep_core::{Archive, Error, Result, crypto, huffman};

/// Artifact ready to be handed to a backend.
#[derive(Debug)]
pub enum Staged {
    /// Plain backups store the source itself.
    Source(PathBuf),
    Temp(NamedTempFile),
}

impl Staged {
    pub fn path(&self) -> &Path {
        match self {
            Staged::Source(path) => path,
            Staged::Temp(temp) => temp.path(),
        }
    }
}

fn ensure_exists(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(path.display())),
        Err(e) => Err(e.into()),
    }
}

fn compress_stage(input: &NamedTempFile) -> Result<NamedTempFile> {
    let mut output = NamedTempFile::new()?;
    huffman::compress(&mut input.reopen()?, output.as_file_mut())?;
    debug!(path = %output.path().display(), "compressed stage");
    Ok(output)
}

fn encrypt_stage(input: &NamedTempFile, key: &str) -> Result<NamedTempFile> {
    let mut output = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(output.as_file_mut());
        crypto::encrypt(&mut BufReader::new(input.reopen()?), &mut writer, key)?;
        writer.flush()?;
    }
    debug!(path = %output.path().display(), "encrypted stage");
    Ok(output)
}

/// Builds the artifact for `source`: archive, then compress and encrypt as requested.
/// `key` is only consulted when `encrypt` is set.
pub fn forward(source: &Path, compress: bool, encrypt: bool, key: &str) -> Result<Staged> {
    if encrypt && key.is_empty() {
        return Err(Error::EmptyKey);
    }
    ensure_exists(source)?;

    if !compress && !encrypt {
        return Ok(Staged::Source(source.to_path_buf()));
    }

    let archived = NamedTempFile::new()?;
    {
        let mut archive = Archive::open(archived.path())?;
        archive.append(source)?;
        archive.flush()?;
    }
    debug!(source = %source.display(), "archived stage");

    let mut current = archived;
    if compress {
        current = compress_stage(&current)?;
    }
    if encrypt {
        current = encrypt_stage(&current, key)?;
    }
    Ok(Staged::Temp(current))
}

/// Reverses [`forward`] from `artifact` into `restore_dir`. The restored path is
/// `restore_dir/filename`.
pub fn reverse(
    artifact: &Path,
    compressed: bool,
    encrypted: bool,
    key: &str,
    restore_dir: &Path,
    filename: &str,
) -> Result<()> {
    if encrypted && key.is_empty() {
        return Err(Error::EmptyKey);
    }
    ensure_exists(artifact)?;

    if !compressed && !encrypted {
        copy_tree(artifact, &restore_dir.join(filename))?;
        return Ok(());
    }

    let mut stage: Option<NamedTempFile> = None;

    if encrypted {
        let mut output = NamedTempFile::new()?;
        {
            let mut writer = BufWriter::new(output.as_file_mut());
            crypto::decrypt(&mut BufReader::new(File::open(artifact)?), &mut writer, key)?;
            writer.flush()?;
        }
        debug!(artifact = %artifact.display(), "decrypted stage");
        stage = Some(output);
    }

    if compressed {
        let mut output = NamedTempFile::new()?;
        match &stage {
            Some(input) => huffman::uncompress(&mut input.reopen()?, output.as_file_mut())?,
            None => huffman::uncompress(&mut File::open(artifact)?, output.as_file_mut())?,
        }
        debug!(artifact = %artifact.display(), "uncompressed stage");
        stage = Some(output);
    }

    let archived = stage.ok_or_else(|| Error::Format("nothing to extract".to_string()))?;
    Archive::open(archived.path())?.extract(restore_dir)?;
    debug!(restore_dir = %restore_dir.display(), "extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source(dir: &Path) -> PathBuf {
        let src = dir.join("project");
        fs::create_dir_all(src.join("src")).unwrap();
        fs::write(src.join("README"), b"read me\n".repeat(100)).unwrap();
        fs::write(src.join("src/main.c"), b"int main() { return 0; }\n").unwrap();
        src
    }

    #[test]
    fn test_every_stage_combination() {
        for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
            let dir = TempDir::new().unwrap();
            let src = source(dir.path());

            let staged = forward(&src, compress, encrypt, "pw").unwrap();
            let artifact = dir.path().join("artifact");
            copy_tree(staged.path(), &artifact).unwrap();

            let out = dir.path().join("out");
            fs::create_dir(&out).unwrap();
            reverse(&artifact, compress, encrypt, "pw", &out, "project").unwrap();

            assert_eq!(
                fs::read(out.join("project/README")).unwrap(),
                fs::read(src.join("README")).unwrap(),
                "compress={compress} encrypt={encrypt}"
            );
            assert_eq!(
                fs::read(out.join("project/src/main.c")).unwrap(),
                b"int main() { return 0; }\n"
            );
        }
    }

    #[test]
    fn test_plain_stages_source_itself() {
        let dir = TempDir::new().unwrap();
        let src = source(dir.path());
        assert!(matches!(forward(&src, false, false, "").unwrap(), Staged::Source(p) if p == src));
    }

    #[test]
    fn test_empty_key_checked_first() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(forward(&missing, false, true, ""), Err(Error::EmptyKey)));
        assert!(matches!(
            reverse(&missing, false, true, "", dir.path(), "x"),
            Err(Error::EmptyKey)
        ));
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = forward(&dir.path().join("missing"), true, false, "").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
