//! Binary artifacts exchanged between tiers: gzipped tarballs addressed
//! by container + name, with a sha256 digest recorded in karya_file.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tar::{Archive, Builder};

/// Container holding microtask input tarballs.
pub const MICROTASK_INPUT: &str = "microtask-input";

/// Container holding assignment output tarballs.
pub const ASSIGNMENT_OUTPUT: &str = "assignment-output";

pub fn input_tarball_name(microtask_id: i64) -> String {
  format!("{microtask_id}.tgz")
}

pub fn output_tarball_name(assignment_id: i64) -> String {
  format!("{assignment_id}.tgz")
}

/// Directory for a container under the local files root, created on
/// first use.
pub fn container_dir(files_root: &Path, container: &str) -> Result<PathBuf> {
  let dir = files_root.join(container);
  fs::create_dir_all(&dir).with_context(|| format!("creating container {:?}", dir))?;
  Ok(dir)
}

pub fn blob_path(files_root: &Path, container: &str, name: &str) -> Result<PathBuf> {
  Ok(container_dir(files_root, container)?.join(name))
}

/// Streaming sha256 of a file, hex encoded.
pub fn checksum_file(path: &Path) -> Result<String> {
  let file = File::open(path).with_context(|| format!("checksumming {:?}", path))?;
  let mut reader = BufReader::new(file);
  let mut hasher = Sha256::new();
  let mut buf = [0u8; 8192];
  loop {
    let n = reader.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

/// Package files into a gzipped tarball. Every source must exist: a
/// missing output file means the assignment is not actually complete and
/// the caller resets it instead of shipping a partial artifact.
pub fn create_tarball(tarball: &Path, files: &[PathBuf]) -> Result<()> {
  for file in files {
    if !file.is_file() {
      return Err(anyhow!("missing file {:?}", file));
    }
  }
  let out = File::create(tarball).with_context(|| format!("creating {:?}", tarball))?;
  let encoder = GzEncoder::new(out, Compression::default());
  let mut builder = Builder::new(encoder);
  for file in files {
    let name = file
      .file_name()
      .ok_or_else(|| anyhow!("unnamed file {:?}", file))?;
    builder.append_path_with_name(file, name)?;
  }
  builder.into_inner()?.finish()?.flush()?;
  Ok(())
}

pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
  fs::create_dir_all(dest)?;
  let file = File::open(tarball).with_context(|| format!("opening {:?}", tarball))?;
  let mut archive = Archive::new(GzDecoder::new(file));
  archive.unpack(dest)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tarball_round_trip_preserves_contents() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    fs::write(&a, b"first recording").unwrap();
    fs::write(&b, b"second recording").unwrap();

    let tarball = dir.path().join("out.tgz");
    create_tarball(&tarball, &[a, b]).unwrap();

    let dest = dir.path().join("unpacked");
    extract_tarball(&tarball, &dest).unwrap();
    assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"first recording");
    assert_eq!(fs::read(dest.join("b.txt")).unwrap(), b"second recording");
  }

  #[test]
  fn tarball_refuses_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.txt");
    fs::write(&present, b"here").unwrap();
    let missing = dir.path().join("missing.txt");

    let tarball = dir.path().join("out.tgz");
    let err = create_tarball(&tarball, &[present, missing]).unwrap_err();
    assert!(err.to_string().contains("missing file"));
  }

  #[test]
  fn checksum_is_stable_and_matches_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("payload");
    fs::write(&file, b"karya").unwrap();

    let from_file = checksum_file(&file).unwrap();
    assert_eq!(from_file.len(), 64);
    assert_eq!(from_file, checksum_bytes(b"karya"));
    assert_ne!(from_file, checksum_bytes(b"other"));
  }

  #[test]
  fn blob_path_lands_inside_the_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = blob_path(dir.path(), MICROTASK_INPUT, &input_tarball_name(42)).unwrap();
    assert!(path.ends_with("microtask-input/42.tgz"));
    assert!(path.parent().unwrap().is_dir());
  }
}
