//! Archive codec for cache blobs.

use crate::errors::EngineError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Packs paths into a single file and unpacks it again.
///
/// Implementations are blocking; callers on an async runtime should run them
/// on a blocking thread.
pub trait Archiver: Send + Sync {
    /// Archives `src_paths` into `dst_file`.
    fn archive(&self, src_paths: &[String], dst_file: &Path) -> Result<(), EngineError>;

    /// Extracts `archive_file` into `dst_dir`.
    fn unarchive(&self, archive_file: &Path, dst_dir: &Path) -> Result<(), EngineError>;
}

/// Tar archiver with an optional gzip layer.
///
/// Relative source paths are read from `base_dir` and stored under the same
/// relative name. Absolute paths are stored with their root stripped. Each
/// directory entry precedes its contents and is written with mode 0755.
/// Symlinks are stored as links and never followed.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    base_dir: PathBuf,
    compress: bool,
}

impl TarArchiver {
    /// Creates an archiver reading relative paths from `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            compress: false,
        }
    }

    /// Enables or disables gzip.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    fn write_entries<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        src_paths: &[String],
    ) -> Result<(), EngineError> {
        for src in src_paths {
            let path = Path::new(src);
            let full = if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.base_dir.join(path)
            };
            let name = entry_name(path)?;
            append_tree(builder, &full, &name)?;
        }
        Ok(())
    }
}

impl Archiver for TarArchiver {
    fn archive(&self, src_paths: &[String], dst_file: &Path) -> Result<(), EngineError> {
        let file = BufWriter::new(File::create(dst_file)?);

        if self.compress {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.follow_symlinks(false);
            self.write_entries(&mut builder, src_paths)?;
            builder.into_inner()?.finish()?.flush()?;
        } else {
            let mut builder = tar::Builder::new(file);
            builder.follow_symlinks(false);
            self.write_entries(&mut builder, src_paths)?;
            builder.into_inner()?.flush()?;
        }

        debug!(dst = %dst_file.display(), paths = src_paths.len(), "Archived paths");
        Ok(())
    }

    fn unarchive(&self, archive_file: &Path, dst_dir: &Path) -> Result<(), EngineError> {
        let file = BufReader::new(File::open(archive_file)?);
        let reader: Box<dyn Read> = if self.compress {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive.unpack(dst_dir)?;

        debug!(src = %archive_file.display(), dst = %dst_dir.display(), "Unarchived");
        Ok(())
    }
}

/// Name stored in the archive for a source path.
fn entry_name(path: &Path) -> Result<PathBuf, EngineError> {
    let mut name = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => name.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(EngineError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes the work dir: {}", path.display()),
                )));
            }
        }
    }
    Ok(name)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    full: &Path,
    name: &Path,
) -> Result<(), EngineError> {
    let metadata = fs::symlink_metadata(full)?;

    if !metadata.is_dir() {
        builder.append_path_with_name(full, name)?;
        return Ok(());
    }

    if !name.as_os_str().is_empty() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, io::empty())?;
    }

    let mut children: Vec<_> = fs::read_dir(full)?.collect::<Result<_, _>>()?;
    children.sort_by_key(fs::DirEntry::file_name);
    for child in children {
        append_tree(builder, &child.path(), &name.join(child.file_name()))?;
    }
    Ok(())
}
