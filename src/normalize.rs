//! Container normalization: reduce any artifact to a canonical installer.
//!
//! Flat installers pass through untouched. Containers are unpacked under
//! a scoped guard, their single plausible installer is copied out, and —
//! for the container-wrapping-installer kind — an application bundle is
//! wrapped in a synthesized installer package. Synthesis is
//! deterministic: the same inputs yield a byte-identical package, so the
//! publisher always receives one of exactly two artifact shapes. More
//! than one plausible installer is a hard failure; this module never
//! guesses a tie-break.

use crate::artifact::Artifact;
use crate::catalog::{CatalogEntry, PackageKind};
use crate::container::{ContainerEntry, open_container};
use crate::digest::sha256_of_file;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;

/// Installer package file suffix recognized inside containers.
const INSTALLER_SUFFIX: &str = ".pkg";

/// Application bundle directory suffix recognized inside containers.
const BUNDLE_SUFFIX: &str = ".app";

/// File name suffix of synthesized installer packages.
const SYNTHESIZED_SUFFIX: &str = ".pkg.tzst";

/// Fallback bundle identifier when the bundle metadata is unreadable.
const FALLBACK_IDENTIFIER: &str = "com.unknown.app";

/// Fallback bundle version when the bundle metadata is unreadable.
const FALLBACK_VERSION: &str = "1.0";

/// Errors arising from container normalization.
///
/// All variants are terminal for the catalog entry in this run; no
/// partial artifact is ever passed downstream.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The artifact is not a recognized container format.
    #[error("unsupported-container: {path}")]
    Unsupported {
        /// The offending artifact path.
        path: Utf8PathBuf,
    },

    /// The container's structure could not be decoded.
    #[error("corrupt-container: {reason}")]
    Corrupt {
        /// Description of the defect.
        reason: String,
    },

    /// A container entry attempts to escape the extraction root.
    #[error("path-traversal: {path}")]
    Traversal {
        /// The offending entry path.
        path: String,
    },

    /// The container holds no plausible installer.
    #[error("no-installer-found: container holds no installer payload")]
    NoInstaller,

    /// The container holds more than one plausible installer and no
    /// disambiguation rule applies.
    #[error("ambiguous-contents: {count} plausible installers")]
    Ambiguous {
        /// Number of candidates found.
        count: usize,
    },

    /// Synthesizing the wrapper installer failed.
    #[error("repack-error: {reason}")]
    Repack {
        /// Description of the failure.
        reason: String,
    },

    /// I/O failure during extraction or copy-out.
    #[error("conversion I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The normalizer's output: a canonical installer artifact plus the
/// path whose embedded signature counts for identity verification.
///
/// For containers the signature source is the inner installer or the
/// extracted application bundle — never the container wrapper, which is
/// frequently signed by a different identity or unsigned.
#[derive(Debug, Clone)]
pub struct CanonicalArtifact {
    /// The canonical installer artifact.
    pub artifact: Artifact,
    /// Path to inspect for the publisher identity check.
    pub signature_source: Utf8PathBuf,
}

/// Normalize a fetched artifact according to its declared package kind.
///
/// Extracted payloads land in `workdir` (the entry's private working
/// directory); the container extraction itself is scoped and fully
/// released before this function returns, on every path.
pub fn normalize(
    entry: &CatalogEntry,
    artifact: &Artifact,
    workdir: &Utf8Path,
) -> Result<CanonicalArtifact, ConversionError> {
    match entry.kind {
        PackageKind::Flat => Ok(CanonicalArtifact {
            artifact: artifact.clone(),
            signature_source: artifact.path.clone(),
        }),
        PackageKind::Container | PackageKind::ContainerWithInstaller => {
            normalize_container(entry, artifact, workdir)
        }
    }
}

fn normalize_container(
    entry: &CatalogEntry,
    artifact: &Artifact,
    workdir: &Utf8Path,
) -> Result<CanonicalArtifact, ConversionError> {
    let guard = open_container(&artifact.path, workdir)?;
    let entries = guard.entries()?;

    let installers: Vec<&ContainerEntry> = entries
        .iter()
        .filter(|e| !e.is_dir && has_suffix(&e.name, INSTALLER_SUFFIX))
        .collect();
    let bundles: Vec<&ContainerEntry> = entries
        .iter()
        .filter(|e| e.is_dir && has_suffix(&e.name, BUNDLE_SUFFIX))
        .collect();

    let accepts_bundles = entry.kind == PackageKind::ContainerWithInstaller;
    let candidates = installers.len() + if accepts_bundles { bundles.len() } else { 0 };
    if candidates == 0 {
        return Err(ConversionError::NoInstaller);
    }
    if candidates > 1 {
        return Err(ConversionError::Ambiguous { count: candidates });
    }

    if let Some(installer) = installers.first() {
        extract_installer(entry, installer, workdir)
    } else {
        // Single application bundle under ContainerWithInstaller.
        let bundle = bundles[0];
        wrap_bundle(entry, bundle, workdir)
    }
}

/// Copy the single inner installer out of the container.
fn extract_installer(
    entry: &CatalogEntry,
    installer: &ContainerEntry,
    workdir: &Utf8Path,
) -> Result<CanonicalArtifact, ConversionError> {
    let dest = workdir.join(&installer.name);
    std::fs::copy(&installer.path, &dest)?;
    let len = std::fs::metadata(&dest)?.len();
    let digest = sha256_of_file(&dest)?;
    Ok(CanonicalArtifact {
        artifact: Artifact {
            name: entry.name.clone(),
            path: dest.clone(),
            len,
            digest,
        },
        signature_source: dest,
    })
}

/// Copy the bundle out of the container and synthesize an installer
/// package around it.
fn wrap_bundle(
    entry: &CatalogEntry,
    bundle: &ContainerEntry,
    workdir: &Utf8Path,
) -> Result<CanonicalArtifact, ConversionError> {
    let bundle_out = workdir.join(&bundle.name);
    copy_dir_all(&bundle.path, &bundle_out)?;

    let stem = bundle
        .name
        .strip_suffix(BUNDLE_SUFFIX)
        .unwrap_or(&bundle.name);
    let info = BundleInfo::read(&bundle_out, stem);
    let package_path = workdir.join(format!("{stem}{SYNTHESIZED_SUFFIX}"));

    synthesize_installer(&bundle_out, &bundle.name, &info, &package_path).map_err(|e| {
        ConversionError::Repack {
            reason: e.to_string(),
        }
    })?;

    let len = std::fs::metadata(&package_path)?.len();
    let digest = sha256_of_file(&package_path)?;
    Ok(CanonicalArtifact {
        artifact: Artifact {
            name: entry.name.clone(),
            path: package_path,
            len,
            digest,
        },
        signature_source: bundle_out,
    })
}

fn has_suffix(name: &str, suffix: &str) -> bool {
    name.to_ascii_lowercase().ends_with(suffix)
}

/// Bundle metadata embedded in the synthesized package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    /// Bundle identifier, e.g. `com.example.app`.
    pub identifier: String,
    /// Short version string.
    pub version: String,
    /// Display name.
    pub name: String,
}

impl BundleInfo {
    /// Read metadata from the bundle's property list, falling back to
    /// defaults for missing or non-textual metadata.
    fn read(bundle_dir: &Utf8Path, stem: &str) -> Self {
        let plist = bundle_dir.join("Contents/Info.plist");
        let text = std::fs::read_to_string(&plist).unwrap_or_default();
        Self {
            identifier: plist_string(&text, "CFBundleIdentifier")
                .unwrap_or_else(|| FALLBACK_IDENTIFIER.to_owned()),
            version: plist_string(&text, "CFBundleShortVersionString")
                .unwrap_or_else(|| FALLBACK_VERSION.to_owned()),
            name: plist_string(&text, "CFBundleName").unwrap_or_else(|| stem.to_owned()),
        }
    }
}

/// Scan a textual property list for the `<string>` value following a key.
fn plist_string(text: &str, key: &str) -> Option<String> {
    let key_tag = format!("<key>{key}</key>");
    let after_key = &text[text.find(&key_tag)? + key_tag.len()..];
    let start = after_key.find("<string>")? + "<string>".len();
    let end = after_key[start..].find("</string>")? + start;
    let value = after_key[start..end].trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// Recursively copy a directory tree, preserving symlinks on Unix.
fn copy_dir_all(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for item in src.read_dir_utf8()? {
        let item = item?;
        let target = dst.join(item.file_name());
        let file_type = item.file_type()?;
        if file_type.is_symlink() {
            copy_symlink(item.path(), &target)?;
        } else if file_type.is_dir() {
            copy_dir_all(item.path(), &target)?;
        } else {
            std::fs::copy(item.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    // Symlinks inside bundles are not representable here; copy through.
    std::fs::copy(src, dst).map(|_| ())
}

/// One entry of the synthesized package payload.
enum PayloadEntry {
    Dir,
    File { len: u64, executable: bool },
    Symlink { target: Utf8PathBuf },
}

/// Build the deterministic installer package: a zstd-compressed tarball
/// holding `manifest.json` plus the bundle under
/// `payload/Applications/`. Entries are sorted, timestamps zeroed, and
/// modes normalized so identical inputs produce identical bytes.
fn synthesize_installer(
    bundle_dir: &Utf8Path,
    bundle_name: &str,
    info: &BundleInfo,
    out_path: &Utf8Path,
) -> std::io::Result<()> {
    let out = std::fs::File::create(out_path)?;
    let encoder = zstd::Encoder::new(out, 0)?;
    let mut builder = tar::Builder::new(encoder);

    let manifest = serde_json::to_vec_pretty(info).map_err(std::io::Error::other)?;
    append_entry(
        &mut builder,
        "manifest.json",
        &PayloadEntry::File {
            len: manifest.len() as u64,
            executable: false,
        },
        Some(&manifest[..]),
        None,
    )?;

    let payload_root = format!("payload/Applications/{bundle_name}");
    append_entry(&mut builder, &payload_root, &PayloadEntry::Dir, None, None)?;

    let mut entries = Vec::new();
    collect_payload(bundle_dir, Utf8Path::new(""), &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, kind) in &entries {
        let archive_path = format!("{payload_root}/{rel}");
        let source = bundle_dir.join(rel);
        append_entry(&mut builder, &archive_path, kind, None, Some(&source))?;
    }

    let encoder = builder.into_inner()?;
    let mut out = encoder.finish()?;
    use std::io::Write;
    out.flush()
}

/// Recursively collect payload entries relative to the bundle root.
fn collect_payload(
    root: &Utf8Path,
    rel: &Utf8Path,
    entries: &mut Vec<(Utf8PathBuf, PayloadEntry)>,
) -> std::io::Result<()> {
    let dir = root.join(rel);
    for item in dir.read_dir_utf8()? {
        let item = item?;
        let item_rel = rel.join(item.file_name());
        let file_type = item.file_type()?;
        if file_type.is_symlink() {
            let target = std::fs::read_link(item.path())?;
            let target = Utf8PathBuf::from_path_buf(target)
                .map_err(|p| std::io::Error::other(format!("non-UTF-8 link {}", p.display())))?;
            entries.push((item_rel, PayloadEntry::Symlink { target }));
        } else if file_type.is_dir() {
            entries.push((item_rel.clone(), PayloadEntry::Dir));
            collect_payload(root, &item_rel, entries)?;
        } else {
            let metadata = item.metadata()?;
            entries.push((
                item_rel,
                PayloadEntry::File {
                    len: metadata.len(),
                    executable: is_executable(&metadata),
                },
            ));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Append one entry with normalized header fields.
fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    archive_path: &str,
    kind: &PayloadEntry,
    inline: Option<&[u8]>,
    source: Option<&Utf8Path>,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    match kind {
        PayloadEntry::Dir => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, archive_path, std::io::empty())
        }
        PayloadEntry::Symlink { target } => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            header.set_link_name(target.as_str())?;
            builder.append_data(&mut header, archive_path, std::io::empty())
        }
        PayloadEntry::File { len, executable } => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if *executable { 0o755 } else { 0o644 });
            header.set_size(*len);
            if let Some(bytes) = inline {
                builder.append_data(&mut header, archive_path, bytes)
            } else {
                let source = source.ok_or_else(|| {
                    std::io::Error::other("file entry without a content source")
                })?;
                let file = std::fs::File::open(source)?;
                builder.append_data(&mut header, archive_path, file)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IdentityClaim;
    use crate::container::{active_handles, test_handle_lock};
    use std::io::Write;

    const INFO_PLIST: &str = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
        "<plist version=\"1.0\">\n<dict>\n",
        "  <key>CFBundleIdentifier</key>\n  <string>com.example.demo</string>\n",
        "  <key>CFBundleShortVersionString</key>\n  <string>2.3.1</string>\n",
        "  <key>CFBundleName</key>\n  <string>Demo</string>\n",
        "</dict>\n</plist>\n",
    );

    fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path")
    }

    fn entry(name: &str, kind: PackageKind) -> CatalogEntry {
        CatalogEntry {
            name: name.to_owned(),
            url: format!("https://downloads.example/{name}.zip"),
            kind,
            identity: IdentityClaim::SignerToken("TEAM123456".to_owned()),
        }
    }

    fn artifact_from(path: &Utf8Path, name: &str) -> Artifact {
        let len = std::fs::metadata(path).expect("metadata").len();
        let digest = sha256_of_file(path).expect("digest");
        Artifact {
            name: name.to_owned(),
            path: path.to_owned(),
            len,
            digest,
        }
    }

    /// Build a zip container with file entries and optional app bundle.
    fn zip_container(
        dir: &Utf8Path,
        name: &str,
        files: &[(&str, &[u8])],
        bundle: Option<&str>,
    ) -> Utf8PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (entry_name, bytes) in files {
            writer.start_file(*entry_name, options).expect("start file");
            writer.write_all(bytes).expect("write entry");
        }
        if let Some(bundle_name) = bundle {
            writer
                .add_directory(format!("{bundle_name}/Contents"), options)
                .expect("add dir");
            writer
                .start_file(format!("{bundle_name}/Contents/Info.plist"), options)
                .expect("start plist");
            writer.write_all(INFO_PLIST.as_bytes()).expect("write plist");
            writer
                .start_file(format!("{bundle_name}/Contents/MacOS/Demo"), options)
                .expect("start binary");
            writer.write_all(b"\x7fELFfake").expect("write binary");
        }
        writer.finish().expect("finish zip");
        path
    }

    #[test]
    fn flat_kind_is_passthrough() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let path = root.join("App1.pkg");
        std::fs::write(&path, b"installer").expect("write");
        let artifact = artifact_from(&path, "App1");

        let canonical =
            normalize(&entry("App1", PackageKind::Flat), &artifact, &root).expect("passthrough");
        assert_eq!(canonical.artifact, artifact);
        assert_eq!(canonical.signature_source, path);
    }

    #[test]
    fn container_with_single_installer_extracts_it() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(&root, "App1.zip", &[("Inner.pkg", b"inner-bytes")], None);
        let artifact = artifact_from(&container, "App1");

        let before = active_handles();
        let canonical = normalize(&entry("App1", PackageKind::Container), &artifact, &root)
            .expect("extracts");
        assert_eq!(active_handles(), before, "guard must be released");
        assert_eq!(canonical.artifact.name, "App1");
        assert!(canonical.artifact.path.as_str().ends_with("Inner.pkg"));
        assert_eq!(
            std::fs::read(&canonical.artifact.path).expect("read"),
            b"inner-bytes"
        );
        assert_eq!(canonical.signature_source, canonical.artifact.path);
    }

    #[test]
    fn two_installers_is_ambiguous() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(
            &root,
            "App1.zip",
            &[("A.pkg", b"a"), ("B.pkg", b"b")],
            None,
        );
        let artifact = artifact_from(&container, "App1");

        let before = active_handles();
        let result = normalize(&entry("App1", PackageKind::Container), &artifact, &root);
        assert!(matches!(
            result,
            Err(ConversionError::Ambiguous { count: 2 })
        ));
        assert_eq!(active_handles(), before, "guard released on failure");
    }

    #[test]
    fn empty_container_has_no_installer() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(&root, "App1.zip", &[("README.txt", b"hi")], None);
        let artifact = artifact_from(&container, "App1");

        let result = normalize(&entry("App1", PackageKind::Container), &artifact, &root);
        assert!(matches!(result, Err(ConversionError::NoInstaller)));
    }

    #[test]
    fn plain_container_does_not_accept_bundles() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(&root, "App2.zip", &[], Some("Demo.app"));
        let artifact = artifact_from(&container, "App2");

        let result = normalize(&entry("App2", PackageKind::Container), &artifact, &root);
        assert!(matches!(result, Err(ConversionError::NoInstaller)));
    }

    #[test]
    fn bundle_is_wrapped_into_synthesized_installer() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(&root, "App2.zip", &[], Some("Demo.app"));
        let artifact = artifact_from(&container, "App2");

        let before = active_handles();
        let canonical = normalize(
            &entry("App2", PackageKind::ContainerWithInstaller),
            &artifact,
            &root,
        )
        .expect("wraps bundle");
        assert_eq!(active_handles(), before);
        assert!(canonical.artifact.path.as_str().ends_with("Demo.pkg.tzst"));
        // Signature source is the extracted bundle, not the package.
        assert!(canonical.signature_source.as_str().ends_with("Demo.app"));
        assert!(canonical.signature_source.is_dir());

        // The package carries the manifest with the bundle's metadata.
        let file = std::fs::File::open(&canonical.artifact.path).expect("open package");
        let decoder = zstd::Decoder::new(file).expect("zstd");
        let mut archive = tar::Archive::new(decoder);
        let mut saw_manifest = false;
        for item in archive.entries().expect("entries") {
            let mut item = item.expect("entry");
            if item.path().expect("path").to_string_lossy() == "manifest.json" {
                let mut text = String::new();
                std::io::Read::read_to_string(&mut item, &mut text).expect("read manifest");
                assert!(text.contains("com.example.demo"));
                assert!(text.contains("2.3.1"));
                saw_manifest = true;
            }
        }
        assert!(saw_manifest, "manifest.json must be first-class payload");
    }

    #[test]
    fn synthesis_is_deterministic() {
        let _serial = test_handle_lock();
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let container = zip_container(&root, "App2.zip", &[], Some("Demo.app"));
        let artifact = artifact_from(&container, "App2");
        let catalog_entry = entry("App2", PackageKind::ContainerWithInstaller);

        let first_dir = root.join("first");
        let second_dir = root.join("second");
        std::fs::create_dir_all(&first_dir).expect("mkdir");
        std::fs::create_dir_all(&second_dir).expect("mkdir");

        let first = normalize(&catalog_entry, &artifact, &first_dir).expect("first pass");
        let second = normalize(&catalog_entry, &artifact, &second_dir).expect("second pass");
        assert_eq!(
            std::fs::read(&first.artifact.path).expect("read first"),
            std::fs::read(&second.artifact.path).expect("read second"),
            "same inputs must yield byte-identical packages"
        );
        assert_eq!(first.artifact.digest, second.artifact.digest);
    }

    #[test]
    fn plist_scan_extracts_values() {
        assert_eq!(
            plist_string(INFO_PLIST, "CFBundleIdentifier").as_deref(),
            Some("com.example.demo")
        );
        assert_eq!(plist_string(INFO_PLIST, "CFBundleExecutable"), None);
    }

    #[test]
    fn bundle_info_falls_back_on_missing_plist() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = utf8_dir(&dir);
        let info = BundleInfo::read(&root, "Demo");
        assert_eq!(info.identifier, FALLBACK_IDENTIFIER);
        assert_eq!(info.version, FALLBACK_VERSION);
        assert_eq!(info.name, "Demo");
    }
}
