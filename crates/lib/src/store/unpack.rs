//! Archive extraction for sources, resources and bottles.
//!
//! Formats are picked by file name. Anything that is not a recognized
//! archive is copied into the destination unchanged.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::ArtifactError;

enum Format {
  TarGz,
  Tar,
  Zip,
  /// Compressions without an in-process decoder, handed to the system `tar`.
  ExternalTar,
  Plain,
}

fn detect(path: &Path) -> Format {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().to_lowercase())
    .unwrap_or_default();

  if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    Format::TarGz
  } else if name.ends_with(".tar") {
    Format::Tar
  } else if name.ends_with(".zip") {
    Format::Zip
  } else if [".tar.xz", ".txz", ".tar.bz2", ".tbz", ".tbz2", ".tar.zst"]
    .iter()
    .any(|ext| name.ends_with(ext))
  {
    Format::ExternalTar
  } else {
    Format::Plain
  }
}

/// Unpack `archive` into `dest`, dropping the first `strip` path components
/// of every entry (like `tar --strip-components`).
pub fn unpack_archive(archive: &Path, dest: &Path, strip: usize) -> Result<(), ArtifactError> {
  let err = |message: String| ArtifactError::Unpack {
    path: archive.to_path_buf(),
    message,
  };
  fs::create_dir_all(dest).map_err(|e| err(e.to_string()))?;
  let root = fs::canonicalize(dest).map_err(|e| err(e.to_string()))?;
  debug!(archive = %archive.display(), dest = %dest.display(), strip, "unpacking");

  match detect(archive) {
    Format::TarGz => {
      let file = File::open(archive).map_err(|e| err(e.to_string()))?;
      unpack_tar(flate2::read::GzDecoder::new(BufReader::new(file)), &root, strip).map_err(|e| err(e.to_string()))
    }
    Format::Tar => {
      let file = File::open(archive).map_err(|e| err(e.to_string()))?;
      unpack_tar(BufReader::new(file), &root, strip).map_err(|e| err(e.to_string()))
    }
    Format::Zip => unpack_zip(archive, &root, strip).map_err(err),
    Format::ExternalTar => {
      let status = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .arg(format!("--strip-components={strip}"))
        .status()
        .map_err(|e| err(format!("cannot run tar: {e}")))?;
      if status.success() {
        Ok(())
      } else {
        Err(err(format!("tar exited with {status}")))
      }
    }
    Format::Plain => {
      let name = archive.file_name().ok_or_else(|| err("no file name".to_string()))?;
      fs::copy(archive, dest.join(name)).map_err(|e| err(e.to_string()))?;
      Ok(())
    }
  }
}

/// The directory a build should start in after unpacking into `dir`.
///
/// Source tarballs conventionally wrap everything in one top-level
/// directory (`bind-9.18.19/`); when that is all `dir` holds, step into it.
pub fn source_root(dir: &Path) -> PathBuf {
  let Ok(entries) = fs::read_dir(dir) else {
    return dir.to_path_buf();
  };
  let entries: Vec<_> = entries.filter_map(Result::ok).collect();
  match entries.as_slice() {
    [only] if only.path().is_dir() => only.path(),
    _ => dir.to_path_buf(),
  }
}

/// Relative path of an entry after stripping, or `None` if nothing is left.
fn stripped(path: &Path, strip: usize) -> Option<PathBuf> {
  let kept: PathBuf = path
    .components()
    .filter(|c| matches!(c, Component::Normal(_)))
    .skip(strip)
    .collect();
  (!kept.as_os_str().is_empty()).then_some(kept)
}

/// Fail unless the parent of `target` resolves inside `root`.
///
/// `root` must be canonical. Checked against the deepest existing ancestor,
/// so symlinks planted by earlier entries cannot redirect later ones.
fn check_within(root: &Path, target: &Path) -> io::Result<()> {
  let mut ancestor = target.parent();
  while let Some(dir) = ancestor {
    if fs::symlink_metadata(dir).is_ok() {
      if fs::canonicalize(dir)?.starts_with(root) {
        return Ok(());
      }
      break;
    }
    ancestor = dir.parent();
  }
  Err(io::Error::new(
    io::ErrorKind::InvalidData,
    format!("entry escapes destination: {}", target.display()),
  ))
}

/// Create the parent of `target` and clear a symlink sitting at `target`.
fn prepare_target(root: &Path, target: &Path) -> io::Result<()> {
  check_within(root, target)?;
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent)?;
  }
  if fs::symlink_metadata(target).is_ok_and(|m| m.file_type().is_symlink()) {
    fs::remove_file(target)?;
  }
  Ok(())
}

fn unpack_tar<R: Read>(reader: R, root: &Path, strip: usize) -> io::Result<()> {
  let mut archive = tar::Archive::new(reader);
  archive.set_preserve_permissions(true);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("entry escapes destination: {}", path.display()),
      ));
    }
    let Some(relative) = stripped(&path, strip) else {
      continue;
    };

    let target = root.join(&relative);
    prepare_target(root, &target)?;

    // Hard links name another entry of the same archive.
    if entry.header().entry_type() == tar::EntryType::Link {
      let source = entry
        .link_name()?
        .filter(|name| !name.components().any(|c| matches!(c, Component::ParentDir)))
        .and_then(|name| stripped(&name, strip))
        .map(|name| root.join(name))
        .ok_or_else(|| {
          io::Error::new(
            io::ErrorKind::InvalidData,
            format!("hard link escapes destination: {}", path.display()),
          )
        })?;
      check_within(root, &source)?;
      if fs::symlink_metadata(&target).is_ok() {
        fs::remove_file(&target)?;
      }
      fs::hard_link(&source, &target)?;
      continue;
    }
    entry.unpack(&target)?;
  }
  Ok(())
}

fn unpack_zip(archive: &Path, root: &Path, strip: usize) -> Result<(), String> {
  let file = File::open(archive).map_err(|e| e.to_string())?;
  let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;

  for i in 0..zip.len() {
    let mut entry = zip.by_index(i).map_err(|e| e.to_string())?;
    let Some(name) = entry.enclosed_name() else {
      return Err(format!("entry escapes destination: {}", entry.name()));
    };
    let Some(relative) = stripped(&name, strip) else {
      continue;
    };
    let target = root.join(relative);
    prepare_target(root, &target).map_err(|e| e.to_string())?;

    if entry.is_dir() {
      fs::create_dir_all(&target).map_err(|e| e.to_string())?;
      continue;
    }
    let mut out = File::create(&target).map_err(|e| e.to_string())?;
    io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;

    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(|e| e.to_string())?;
    }
  }
  Ok(())
}
