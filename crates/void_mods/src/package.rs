//! Mod packages
//!
//! A package is a ZIP archive (or an unpacked directory with the same
//! layout) holding `mod.json` at its top level and the mod binary.

use crate::error::LoadError;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

/// Manifest location inside a package
pub const MANIFEST_FILE: &str = "mod.json";

enum Source {
    Archive(ZipArchive<File>),
    Directory,
}

/// An opened mod package
pub struct ModPackage {
    path: PathBuf,
    source: Source,
}

impl ModPackage {
    /// Open a ZIP package or an unpacked package directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Ok(Self {
                path,
                source: Source::Directory,
            });
        }

        let file = File::open(&path).map_err(|e| LoadError::unreadable(&path, e))?;
        let archive = ZipArchive::new(file).map_err(|e| LoadError::unreadable(&path, format!("invalid archive: {}", e)))?;
        Ok(Self {
            path,
            source: Source::Archive(archive),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.source, Source::Archive(_))
    }

    /// Decode the manifest document
    pub fn manifest(&mut self) -> Result<serde_json::Value, LoadError> {
        let bytes = self
            .read_file(MANIFEST_FILE)
            .map_err(|e| LoadError::unreadable(&self.path, e))?
            .ok_or_else(|| LoadError::ManifestMissing {
                path: self.path.clone(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| LoadError::unreadable(&self.path, format!("invalid JSON: {}", e)))
    }

    /// Read a file at the top of the package, `None` if absent
    pub fn read_file(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match &mut self.source {
            Source::Directory => match std::fs::read(self.path.join(name)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
            Source::Archive(archive) => {
                let mut entry = match archive.by_name(name) {
                    Ok(entry) => entry,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                };
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
        }
    }

    /// Path of a file the platform loader can open directly
    ///
    /// Directory packages hand out the file in place. Archives extract it to
    /// `staging_dir`, and the second value is `true`.
    pub fn materialize(&mut self, name: &str, staging_dir: &Path) -> io::Result<Option<(PathBuf, bool)>> {
        if let Source::Directory = self.source {
            let path = child_path(&self.path, name)?;
            return Ok(path.is_file().then_some((path, false)));
        }

        let staged = child_path(staging_dir, name)?;
        let Some(bytes) = self.read_file(name)? else {
            return Ok(None);
        };
        std::fs::create_dir_all(staging_dir)?;
        std::fs::write(&staged, bytes)?;
        log::debug!("Staged '{}' from {} to {}", name, self.path.display(), staged.display());
        Ok(Some((staged, true)))
    }
}

/// `dir` joined with `name`, which must be a single plain path component
pub fn child_path(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(dir.join(name)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' is not a plain file name", name),
        )),
    }
}
