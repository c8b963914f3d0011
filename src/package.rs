// src/package.rs

//! Artifact packaging and binary stripping
//!
//! The staged destdir becomes a single `<name>-<version>.tar.xz` with a
//! `.sha256` sidecar carrying the content hash. Stripping walks the destdir
//! and runs `strip --strip-unneeded` on every ELF file; strip problems are
//! warnings, never build failures.

use crate::error::{Error, Result};
use crate::hash;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use xz2::write::XzEncoder;

const XZ_LEVEL: u32 = 6;
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Pack `destdir` into `artifact` and write the `.sha256` sidecar.
/// Returns the artifact's content hash.
pub fn create_artifact(destdir: &Path, artifact: &Path) -> Result<String> {
    if let Some(parent) = artifact.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::PackageFailed(format!("create {}: {e}", parent.display())))?;
    }

    let file = File::create(artifact)
        .map_err(|e| Error::PackageFailed(format!("create {}: {e}", artifact.display())))?;
    let encoder = XzEncoder::new(BufWriter::new(file), XZ_LEVEL);

    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    builder
        .append_dir_all(".", destdir)
        .map_err(|e| Error::PackageFailed(format!("archive {}: {e}", destdir.display())))?;

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| Error::PackageFailed(format!("finish {}: {e}", artifact.display())))?
        .flush()
        .map_err(|e| Error::PackageFailed(format!("flush {}: {e}", artifact.display())))?;

    let digest = hash::sha256_file(artifact)?;

    let sidecar = sidecar_path(artifact);
    let artifact_name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    std::fs::write(&sidecar, format!("{digest}  {artifact_name}\n"))
        .map_err(|e| Error::PackageFailed(format!("write {}: {e}", sidecar.display())))?;

    info!(artifact = %artifact.display(), %digest, "packaged");
    Ok(digest)
}

/// Path of the checksum sidecar next to an artifact.
pub fn sidecar_path(artifact: &Path) -> std::path::PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sha256");
    std::path::PathBuf::from(name)
}

/// Verify an artifact against its sidecar.
pub fn verify_artifact(artifact: &Path) -> Result<String> {
    let sidecar = sidecar_path(artifact);
    let contents = std::fs::read_to_string(&sidecar)
        .map_err(|e| Error::PackageFailed(format!("read {}: {e}", sidecar.display())))?;
    let expected = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::PackageFailed(format!("empty sidecar {}", sidecar.display())))?;

    hash::verify_file(artifact, expected)
}

/// Whether a destdir holds at least one regular file other than libtool
/// droppings (`*.la`) and pkg-config files (`*.pc`). A package is never
/// recorded `ok` unless this held at packaging time.
pub fn has_payload(destdir: &Path) -> bool {
    destdir.exists()
        && WalkDir::new(destdir)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|entry| {
                entry.file_type().is_file()
                    && !entry
                        .file_name()
                        .to_str()
                        .map(|n| n.ends_with(".la") || n.ends_with(".pc"))
                        .unwrap_or(false)
            })
}

/// Walk the destdir and strip every ELF file. Returns the number of files
/// stripped. Failures to strip individual files are warnings only.
pub fn strip_destdir(destdir: &Path) -> Result<usize> {
    let mut stripped = 0;

    for entry in WalkDir::new(destdir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_elf(path) {
            continue;
        }

        match Command::new("strip").arg("--strip-unneeded").arg(path).output() {
            Ok(output) if output.status.success() => {
                debug!(file = %path.display(), "stripped");
                stripped += 1;
            }
            Ok(output) => {
                // Some ELF files legitimately refuse stripping (e.g. linker
                // scripts masquerading with an ELF payload inside).
                warn!(
                    file = %path.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "strip refused"
                );
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "strip not runnable");
            }
        }
    }

    Ok(stripped)
}

fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|()| magic == ELF_MAGIC)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_destdir(tmp: &TempDir) -> std::path::PathBuf {
        let destdir = tmp.path().join("destdir");
        std::fs::create_dir_all(destdir.join("usr/bin")).unwrap();
        std::fs::write(destdir.join("usr/bin/tool"), "#!/bin/sh\necho ok\n").unwrap();
        std::fs::create_dir_all(destdir.join("etc")).unwrap();
        std::fs::write(destdir.join("etc/tool.conf"), "key=value\n").unwrap();
        destdir
    }

    #[test]
    fn test_create_and_verify_artifact() {
        let tmp = TempDir::new().unwrap();
        let destdir = make_destdir(&tmp);
        let artifact = tmp.path().join("packages/tool-1.0.tar.xz");

        let digest = create_artifact(&destdir, &artifact).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(artifact.exists());
        assert!(sidecar_path(&artifact).exists());

        assert_eq!(verify_artifact(&artifact).unwrap(), digest);
    }

    #[test]
    fn test_artifact_roundtrips_contents() {
        let tmp = TempDir::new().unwrap();
        let destdir = make_destdir(&tmp);
        let artifact = tmp.path().join("tool-1.0.tar.xz");
        create_artifact(&destdir, &artifact).unwrap();

        let out = tmp.path().join("unpacked");
        crate::extract::extract(&artifact, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("usr/bin/tool")).unwrap(),
            "#!/bin/sh\necho ok\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("etc/tool.conf")).unwrap(),
            "key=value\n"
        );
    }

    #[test]
    fn test_tampered_artifact_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let destdir = make_destdir(&tmp);
        let artifact = tmp.path().join("tool-1.0.tar.xz");
        create_artifact(&destdir, &artifact).unwrap();

        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&artifact)
            .unwrap();
        f.write_all(b"tamper").unwrap();
        drop(f);

        assert!(verify_artifact(&artifact).is_err());
    }

    #[test]
    fn test_strip_skips_non_elf() {
        let tmp = TempDir::new().unwrap();
        let destdir = make_destdir(&tmp);

        // Shell scripts and config files are not ELF; nothing to strip.
        let count = strip_destdir(&destdir).unwrap();
        assert_eq!(count, 0);
        // Files untouched
        assert!(destdir.join("usr/bin/tool").exists());
    }

    #[test]
    fn test_has_payload() {
        let tmp = TempDir::new().unwrap();
        let destdir = tmp.path().join("destdir");

        // Missing, empty, and trivial-only destdirs have no payload.
        assert!(!has_payload(&destdir));
        std::fs::create_dir_all(destdir.join("usr/lib")).unwrap();
        assert!(!has_payload(&destdir));
        std::fs::write(destdir.join("usr/lib/libfoo.la"), "la").unwrap();
        std::fs::write(destdir.join("usr/lib/foo.pc"), "pc").unwrap();
        assert!(!has_payload(&destdir));

        std::fs::write(destdir.join("usr/lib/libfoo.so"), "elf-ish").unwrap();
        assert!(has_payload(&destdir));
    }

    #[test]
    fn test_is_elf_detection() {
        let tmp = TempDir::new().unwrap();
        let elf = tmp.path().join("elfish");
        std::fs::write(&elf, [0x7f, b'E', b'L', b'F', 0x02, 0x01]).unwrap();
        assert!(is_elf(&elf));

        let text = tmp.path().join("text");
        std::fs::write(&text, "just text").unwrap();
        assert!(!is_elf(&text));
    }
}
