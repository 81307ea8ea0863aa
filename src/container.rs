//! Container handling: detection, scoped unpack, guaranteed release.
//!
//! A container is a disk-image-style wrapper holding payload files. It
//! is unpacked read-only into a scoped guard whose `Drop` releases the
//! extraction on every exit path, so handles can never leak; a global
//! counter of live guards is exposed for tests to assert balance.
//! Entry paths are validated against traversal before anything is
//! written.

use crate::normalize::ConversionError;
use camino::{Utf8Path, Utf8PathBuf};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Count of currently held container guards.
static ACTIVE_HANDLES: AtomicUsize = AtomicUsize::new(0);

/// Number of container guards currently held, process-wide.
///
/// After any normalization (success or failure) this returns to its
/// prior value; tests use it to assert mount/unmount balance.
#[must_use]
pub fn active_handles() -> usize {
    ACTIVE_HANDLES.load(Ordering::SeqCst)
}

/// Serialize tests that observe the global handle counter.
#[cfg(test)]
pub(crate) fn test_handle_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Supported container formats, detected from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// A zip archive.
    Zip,
    /// A gzip-compressed tarball.
    TarGz,
    /// A zstd-compressed tarball.
    TarZst,
}

impl ContainerFormat {
    /// Detect the container format from a path's file name.
    #[must_use]
    pub fn detect(path: &Utf8Path) -> Option<Self> {
        let name = path.file_name()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::TarZst)
        } else {
            None
        }
    }
}

/// A top-level entry of an opened container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Entry file name.
    pub name: String,
    /// Absolute path inside the guard's extraction root.
    pub path: Utf8PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Scoped handle over an unpacked container.
///
/// Holds the extraction directory alive; dropping the guard removes the
/// extraction and decrements the live-handle counter, regardless of how
/// the scope exits.
#[derive(Debug)]
pub struct ContainerGuard {
    root: Utf8PathBuf,
    // Removal happens via TempDir's own Drop.
    _scratch: tempfile::TempDir,
}

impl ContainerGuard {
    fn acquire(scratch: tempfile::TempDir) -> Result<Self, ConversionError> {
        let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
            .map_err(|p| ConversionError::Corrupt {
                reason: format!("non-UTF-8 extraction path {}", p.display()),
            })?;
        ACTIVE_HANDLES.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            root,
            _scratch: scratch,
        })
    }

    /// Root directory of the unpacked contents.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Enumerate the container's top-level entries, skipping hidden
    /// files, sorted by name for deterministic disambiguation.
    pub fn entries(&self) -> Result<Vec<ContainerEntry>, ConversionError> {
        let mut entries = Vec::new();
        for item in self.root.read_dir_utf8().map_err(ConversionError::Io)? {
            let item = item.map_err(ConversionError::Io)?;
            let name = item.file_name().to_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = item.file_type().map_err(ConversionError::Io)?.is_dir();
            entries.push(ContainerEntry {
                name,
                path: item.path().to_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        ACTIVE_HANDLES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Unpack a container read-only into a scoped guard.
///
/// The guard is acquired before extraction begins, so a failed unpack
/// still releases its handle when the error propagates.
///
/// # Errors
///
/// Returns [`ConversionError::Unsupported`] for unrecognized formats and
/// [`ConversionError::Corrupt`] / [`ConversionError::Traversal`] /
/// [`ConversionError::Io`] for defective archives.
pub fn open_container(
    path: &Utf8Path,
    scratch_parent: &Utf8Path,
) -> Result<ContainerGuard, ConversionError> {
    let format = ContainerFormat::detect(path).ok_or_else(|| ConversionError::Unsupported {
        path: path.to_owned(),
    })?;
    std::fs::create_dir_all(scratch_parent).map_err(ConversionError::Io)?;
    let scratch = tempfile::Builder::new()
        .prefix("container-")
        .tempdir_in(scratch_parent)
        .map_err(ConversionError::Io)?;
    let guard = ContainerGuard::acquire(scratch)?;

    match format {
        ContainerFormat::Zip => unpack_zip(path, guard.root())?,
        ContainerFormat::TarGz => {
            let file = std::fs::File::open(path).map_err(ConversionError::Io)?;
            unpack_tar(flate2::read::GzDecoder::new(file), guard.root())?;
        }
        ContainerFormat::TarZst => {
            let file = std::fs::File::open(path).map_err(ConversionError::Io)?;
            let decoder = zstd::Decoder::new(file).map_err(ConversionError::Io)?;
            unpack_tar(decoder, guard.root())?;
        }
    }
    Ok(guard)
}

/// Unpack a zip archive, validating each entry path.
fn unpack_zip(path: &Utf8Path, dest: &Utf8Path) -> Result<(), ConversionError> {
    let file = std::fs::File::open(path).map_err(ConversionError::Io)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ConversionError::Corrupt {
        reason: e.to_string(),
    })?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ConversionError::Corrupt {
                reason: e.to_string(),
            })?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ConversionError::Traversal {
                path: entry.name().to_owned(),
            });
        };
        let out_path = dest.as_std_path().join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(ConversionError::Io)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_err(ConversionError::Io)?;
            }
            let mut out = std::fs::File::create(&out_path).map_err(ConversionError::Io)?;
            std::io::copy(&mut entry, &mut out).map_err(ConversionError::Io)?;
        }
    }
    Ok(())
}

/// Unpack a tar stream, validating each entry path.
fn unpack_tar<R: Read>(reader: R, dest: &Utf8Path) -> Result<(), ConversionError> {
    let mut archive = tar::Archive::new(reader);
    for entry_result in archive.entries().map_err(tar_corrupt)? {
        let mut entry = entry_result.map_err(tar_corrupt)?;
        let entry_path = entry.path().map_err(tar_corrupt)?.into_owned();
        validate_entry_path(&entry_path)?;

        let out_path = dest.as_std_path().join(&entry_path);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(ConversionError::Io)?;
        }
        entry.unpack(&out_path).map_err(tar_corrupt)?;
    }
    Ok(())
}

fn tar_corrupt(e: std::io::Error) -> ConversionError {
    ConversionError::Corrupt {
        reason: e.to_string(),
    }
}

/// Validate that an archive entry path does not escape the destination
/// via `..` components or absolute paths.
fn validate_entry_path(path: &Path) -> Result<(), ConversionError> {
    if path.is_absolute() {
        return Err(ConversionError::Traversal {
            path: path.display().to_string(),
        });
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ConversionError::Traversal {
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use std::path::PathBuf;

    fn utf8(path: &Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("utf8 path")
    }

    /// Build a zip container with the given (name, bytes) file entries.
    fn zip_fixture(dir: &Utf8Path, name: &str, files: &[(&str, &[u8])]) -> Utf8PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (entry_name, bytes) in files {
            writer.start_file(*entry_name, options).expect("start file");
            writer.write_all(bytes).expect("write entry");
        }
        writer.finish().expect("finish zip");
        path
    }

    #[rstest]
    #[case::zip("a.zip", Some(ContainerFormat::Zip))]
    #[case::tgz("a.tar.gz", Some(ContainerFormat::TarGz))]
    #[case::tgz_short("a.tgz", Some(ContainerFormat::TarGz))]
    #[case::tzst("a.tar.zst", Some(ContainerFormat::TarZst))]
    #[case::uppercase("A.ZIP", Some(ContainerFormat::Zip))]
    #[case::flat_pkg("a.pkg", None)]
    fn format_detection(#[case] name: &str, #[case] expected: Option<ContainerFormat>) {
        assert_eq!(
            ContainerFormat::detect(Utf8Path::new(name)),
            expected
        );
    }

    #[test]
    fn zip_container_unpacks_and_enumerates() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8(dir.path());
        let archive = zip_fixture(
            &root,
            "bundle.zip",
            &[("Example.pkg", b"pkg-bytes"), (".hidden", b"x")],
        );

        let before = active_handles();
        {
            let guard = open_container(&archive, &root).expect("opens");
            assert_eq!(active_handles(), before + 1);
            let entries = guard.entries().expect("entries");
            // Hidden entries are skipped.
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "Example.pkg");
            assert!(!entries[0].is_dir);
            assert_eq!(
                std::fs::read(&entries[0].path).expect("read entry"),
                b"pkg-bytes"
            );
        }
        assert_eq!(active_handles(), before);
    }

    #[test]
    fn tar_zst_container_unpacks() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8(dir.path());
        let archive_path = root.join("bundle.tar.zst");

        let out = std::fs::File::create(&archive_path).expect("create archive");
        let encoder = zstd::Encoder::new(out, 0).expect("zstd encoder");
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(9);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "Example.pkg", &b"pkg-bytes"[..])
            .expect("append");
        let encoder = builder.into_inner().expect("tar finish");
        encoder.finish().expect("zstd finish");

        let guard = open_container(&archive_path, &root).expect("opens");
        let entries = guard.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Example.pkg");
    }

    #[test]
    fn unsupported_format_rejected_without_handle() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8(dir.path());
        let path = root.join("installer.pkg");
        std::fs::write(&path, b"flat").expect("write");

        let before = active_handles();
        let result = open_container(&path, &root);
        assert!(matches!(result, Err(ConversionError::Unsupported { .. })));
        assert_eq!(active_handles(), before);
    }

    #[test]
    fn corrupt_archive_releases_handle() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8(dir.path());
        let path = root.join("broken.zip");
        std::fs::write(&path, b"this is not a zip archive").expect("write");

        let before = active_handles();
        let result = open_container(&path, &root);
        assert!(matches!(result, Err(ConversionError::Corrupt { .. })));
        assert_eq!(active_handles(), before);
    }

    #[rstest]
    #[case::parent_dir("../escape.txt")]
    #[case::nested_parent("payload/../../escape.txt")]
    #[case::absolute("/etc/passwd")]
    fn traversal_paths_rejected(#[case] bad: &str) {
        let result = validate_entry_path(&PathBuf::from(bad));
        assert!(matches!(result, Err(ConversionError::Traversal { .. })));
    }

    #[test]
    fn normal_entry_paths_accepted() {
        assert!(validate_entry_path(&PathBuf::from("Example.app/Contents/Info.plist")).is_ok());
    }
}
