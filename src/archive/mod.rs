use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::{debug, error, info, warn};
use tar::Archive;
use xz2::read::XzDecoder;
use zip::read::ZipArchive;

use crate::component::models::Category;
use crate::error::{ComponentError, ComponentResult};
use crate::paths::ComponentPaths;

/// Suffixes stripped from an archive's top-level directory after extraction.
const ARCH_SUFFIXES: [&str; 2] = ["_x86_64", "-x86_64"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Tar,
    Zip,
}

impl ArchiveKind {
    /// Sniff the container format from the first bytes of the file.
    fn detect(path: &Path) -> ComponentResult<Self> {
        let mut magic = [0u8; 6];
        let mut file = fs::File::open(path)
            .map_err(|e| ComponentError::io(format!("failed to open {}", path.display()), e))?;
        let read = file
            .read(&mut magic)
            .map_err(|e| ComponentError::io(format!("failed to read {}", path.display()), e))?;
        let magic = &magic[..read];
        if magic.starts_with(&[0x1f, 0x8b]) {
            Ok(ArchiveKind::TarGz)
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Ok(ArchiveKind::TarXz)
        } else if magic.starts_with(b"BZh") {
            Ok(ArchiveKind::TarBz2)
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Ok(ArchiveKind::TarZst)
        } else if magic.starts_with(b"PK\x03\x04") {
            Ok(ArchiveKind::Zip)
        } else if magic.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c])
            || magic.starts_with(b"Rar!")
        {
            Err(ComponentError::UnsupportedArchive(
                path.display().to_string(),
            ))
        } else {
            Ok(ArchiveKind::Tar)
        }
    }
}

/// Unpacks staged archives into their category directory.
#[derive(Clone, Debug)]
pub struct ArchiveInstaller {
    paths: ComponentPaths,
}

impl ArchiveInstaller {
    pub fn new(paths: ComponentPaths) -> Self {
        Self { paths }
    }

    /// Extract `archive_name` from the staging directory and normalize its top-level directory.
    ///
    /// On a corrupt archive the staged file and any freshly created partial directory
    /// are removed, so no half-extracted component survives under its final name.
    pub fn extract(
        &self,
        name: &str,
        category: Category,
        archive_name: &str,
    ) -> ComponentResult<PathBuf> {
        let archive_path = self.paths.staged_file(archive_name);
        let dest = self.paths.extraction_root(category, name);
        info!(
            "extract: {} into {} ({category})",
            archive_path.display(),
            dest.display()
        );

        let existed_before = dest.exists();
        let base_dir = dest.join(archive_base_name(archive_name));
        let base_existed = base_dir.exists();
        let mut root_dir: Option<(String, bool)> = None;

        let unpacked = fs::create_dir_all(&dest)
            .map_err(|e| ComponentError::io(format!("failed to create {}", dest.display()), e))
            .and_then(|_| ArchiveKind::detect(&archive_path))
            .and_then(|kind| {
                let root = first_root_entry(&archive_path, kind)?;
                root_dir = Some((root.clone(), dest.join(&root).exists()));
                unpack(&archive_path, kind, &dest)?;
                Ok(root)
            });

        let root = match unpacked {
            Ok(root) => root,
            Err(err) => {
                error!("extract: {} failed: {err}", archive_path.display());
                if archive_path.is_file() {
                    let _ = fs::remove_file(&archive_path);
                }
                if let Some((root, false)) = &root_dir {
                    remove_dir_best_effort(&dest.join(root));
                }
                if !base_existed {
                    remove_dir_best_effort(&base_dir);
                }
                if !existed_before && category.nests_by_name() {
                    remove_dir_best_effort(&dest);
                }
                return Err(err);
            }
        };

        let extracted = dest.join(&root);
        let Some(stripped) = strip_arch_suffix(&root) else {
            debug!("extract: {} ready", extracted.display());
            return Ok(extracted);
        };

        let target = dest.join(stripped);
        if target.exists() {
            error!("extract: component already exists at {}", target.display());
            if matches!(root_dir, Some((_, false))) {
                remove_dir_best_effort(&extracted);
            }
            return Err(ComponentError::AlreadyExists(target));
        }
        fs::rename(&extracted, &target).map_err(|e| {
            ComponentError::io(
                format!(
                    "failed to rename {} to {}",
                    extracted.display(),
                    target.display()
                ),
                e,
            )
        })?;
        debug!("extract: normalized {root} to {stripped}");
        Ok(target)
    }
}

/// `foo_x86_64` becomes `foo`; names without a recognized suffix are left alone.
pub fn strip_arch_suffix(name: &str) -> Option<&str> {
    ARCH_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|stripped| !stripped.is_empty())
}

fn archive_base_name(archive_name: &str) -> &str {
    [
        ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tar.zst", ".tar", ".zip",
    ]
    .iter()
    .find_map(|ext| archive_name.strip_suffix(ext))
    .unwrap_or(archive_name)
}

/// First normal path component of `entry`, skipping `./` prefixes.
fn top_level_name(entry: &Path) -> Option<String> {
    entry.components().find_map(|component| match component {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    })
}

fn corrupt(archive: &Path, reason: impl ToString) -> ComponentError {
    ComponentError::CorruptArchive {
        archive: archive.display().to_string(),
        reason: reason.to_string(),
    }
}

fn open_tar(path: &Path, kind: ArchiveKind) -> ComponentResult<Archive<Box<dyn Read>>> {
    let file = fs::File::open(path)
        .map_err(|e| ComponentError::io(format!("failed to open {}", path.display()), e))?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveKind::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveKind::TarZst => {
            Box::new(zstd::stream::read::Decoder::new(file).map_err(|e| corrupt(path, e))?)
        }
        ArchiveKind::Tar | ArchiveKind::Zip => Box::new(file),
    };
    Ok(Archive::new(reader))
}

fn first_root_entry(path: &Path, kind: ArchiveKind) -> ComponentResult<String> {
    let root = match kind {
        ArchiveKind::Zip => {
            let file = fs::File::open(path)
                .map_err(|e| ComponentError::io(format!("failed to open {}", path.display()), e))?;
            let mut archive = ZipArchive::new(file).map_err(|e| corrupt(path, e))?;
            let mut found = None;
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| corrupt(path, e))?;
                if let Some(name) = top_level_name(&entry.mangled_name()) {
                    found = Some(name);
                    break;
                }
            }
            found
        }
        _ => {
            let mut archive = open_tar(path, kind)?;
            let mut found = None;
            for entry in archive.entries().map_err(|e| corrupt(path, e))? {
                let entry = entry.map_err(|e| corrupt(path, e))?;
                let entry_path = entry.path().map_err(|e| corrupt(path, e))?;
                if let Some(name) = top_level_name(&entry_path) {
                    found = Some(name);
                    break;
                }
            }
            found
        }
    };
    root.ok_or_else(|| corrupt(path, "archive has no entries"))
}

fn unpack(path: &Path, kind: ArchiveKind, dest: &Path) -> ComponentResult<()> {
    match kind {
        ArchiveKind::Zip => extract_zip(path, dest),
        _ => open_tar(path, kind)?
            .unpack(dest)
            .map_err(|e| corrupt(path, e)),
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> ComponentResult<()> {
    let file = fs::File::open(archive_path)
        .map_err(|e| ComponentError::io(format!("failed to open {}", archive_path.display()), e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| corrupt(archive_path, e))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupt(archive_path, e))?;
        let out_path = dest.join(entry.mangled_name());
        if entry.name().ends_with('/') {
            fs::create_dir_all(&out_path)
                .map_err(|e| ComponentError::io("zip dir create error", e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ComponentError::io("zip parent dir error", e))?;
        }
        let mut out_file = fs::File::create(&out_path)
            .map_err(|e| ComponentError::io("zip create file error", e))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| corrupt(archive_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let permissions = fs::Permissions::from_mode(mode);
                if let Err(err) = fs::set_permissions(&out_path, permissions) {
                    warn!(
                        "extract: could not set mode {mode:o} on {}: {err}",
                        out_path.display()
                    );
                }
            }
        }
    }
    Ok(())
}

fn remove_dir_best_effort(dir: &Path) {
    if dir.is_dir() {
        match fs::remove_dir_all(dir) {
            Ok(()) => debug!("extract: removed partial directory {}", dir.display()),
            Err(err) => warn!("extract: could not remove {}: {err}", dir.display()),
        }
    }
}
