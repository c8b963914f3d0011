// src/extract.rs

//! Workspace materialization: archive extraction and patch application
//!
//! Archive dispatch sniffs magic bytes first and falls back to the file
//! extension. Supported families: tar (gzip, xz/lzma, bzip2 filters), zip,
//! and bare single-file gzip. Patches go through a dry-run ladder: strip
//! level 1 first, then 0; a patch passing neither rejects the package.

use crate::error::{Error, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use xz2::read::XzDecoder;

/// Detected archive family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGzip,
    TarXz,
    TarBzip2,
    Tar,
    Zip,
    /// Single-file gzip; output name is the archive name with `.gz` stripped
    Gzip,
}

impl ArchiveKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TarGzip => "tar+gzip",
            Self::TarXz => "tar+xz",
            Self::TarBzip2 => "tar+bzip2",
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::Gzip => "gzip",
        }
    }
}

/// The `ustar` magic sits at offset 257 of a tar header.
const TAR_MAGIC_OFFSET: usize = 257;

fn looks_like_tar(header: &[u8]) -> bool {
    header.len() >= TAR_MAGIC_OFFSET + 5 && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// Identify an archive. Content sniffing is primary; the extension only
/// breaks ties content cannot (pre-POSIX tar, empty gzip members).
pub fn detect_kind(path: &Path) -> Result<ArchiveKind> {
    let mut file = File::open(path)
        .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", path.display())))?;

    let mut magic = [0u8; 6];
    let n = file
        .read(&mut magic)
        .map_err(|e| Error::ExtractFailed(format!("read {}: {e}", path.display())))?;
    let magic = &magic[..n];

    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");

    if magic.starts_with(&[0x1f, 0x8b]) {
        // gzip carrying a tar stream, or a bare compressed file: peek at the
        // decompressed header.
        let file = File::open(path)
            .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", path.display())))?;
        let mut header = vec![0u8; TAR_MAGIC_OFFSET + 8];
        let read = read_up_to(GzDecoder::new(file), &mut header)
            .map_err(|e| Error::ExtractFailed(format!("sniff {}: {e}", path.display())))?;

        if looks_like_tar(&header[..read]) || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Ok(ArchiveKind::TarGzip);
        }
        return Ok(ArchiveKind::Gzip);
    }

    if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        return Ok(ArchiveKind::TarXz);
    }
    if magic.starts_with(b"BZh") {
        return Ok(ArchiveKind::TarBzip2);
    }
    if magic.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
        return Ok(ArchiveKind::Zip);
    }

    {
        let mut header = vec![0u8; TAR_MAGIC_OFFSET + 8];
        let file = File::open(path)
            .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", path.display())))?;
        let read = read_up_to(file, &mut header)
            .map_err(|e| Error::ExtractFailed(format!("read {}: {e}", path.display())))?;
        if looks_like_tar(&header[..read]) {
            return Ok(ArchiveKind::Tar);
        }
    }

    // Extension fallback for contents the sniffer could not place.
    if name.ends_with(".tar") {
        return Ok(ArchiveKind::Tar);
    }
    if name.ends_with(".zip") {
        return Ok(ArchiveKind::Zip);
    }
    if name.ends_with(".gz") {
        return Ok(ArchiveKind::Gzip);
    }

    Err(Error::ExtractFailed(format!(
        "unrecognized archive format: {}",
        path.display()
    )))
}

fn read_up_to(mut reader: impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            // A truncated compressed stream is fine for sniffing purposes.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Extract one archive into `dest`. The caller owns quarantine-on-failure.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    extract_with(archive, dest, true)
}

/// Extract without preserving archive mtimes. Installers want the unpacked
/// files stamped with the current time so post-install verification can
/// distinguish them from the pre-image.
pub fn extract_fresh_mtime(archive: &Path, dest: &Path) -> Result<()> {
    extract_with(archive, dest, false)
}

fn extract_with(archive: &Path, dest: &Path, preserve_mtime: bool) -> Result<()> {
    let kind = detect_kind(archive)?;
    debug!(archive = %archive.display(), kind = kind.name(), "extracting");

    fs::create_dir_all(dest)
        .map_err(|e| Error::ExtractFailed(format!("create {}: {e}", dest.display())))?;

    let open = || {
        File::open(archive)
            .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", archive.display())))
    };

    match kind {
        ArchiveKind::TarGzip => unpack_tar(GzDecoder::new(open()?), dest, preserve_mtime),
        ArchiveKind::TarXz => unpack_tar(XzDecoder::new(open()?), dest, preserve_mtime),
        ArchiveKind::TarBzip2 => unpack_tar(BzDecoder::new(open()?), dest, preserve_mtime),
        ArchiveKind::Tar => unpack_tar(open()?, dest, preserve_mtime),
        ArchiveKind::Zip => unpack_zip(archive, dest),
        ArchiveKind::Gzip => unpack_bare_gzip(archive, dest),
    }?;

    info!(archive = %archive.display(), dest = %dest.display(), "extracted");
    Ok(())
}

fn unpack_tar(reader: impl Read, dest: &Path, preserve_mtime: bool) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(preserve_mtime);
    archive.set_unpack_xattrs(false);

    for entry in archive
        .entries()
        .map_err(|e| Error::ExtractFailed(format!("read tar entries: {e}")))?
    {
        let mut entry = entry.map_err(|e| Error::ExtractFailed(format!("read tar entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| Error::ExtractFailed(format!("tar entry path: {e}")))?;
        if path
            .components()
            .any(|c| c == std::path::Component::ParentDir)
        {
            return Err(Error::ExtractFailed(format!(
                "archive entry escapes destination: {}",
                path.display()
            )));
        }

        entry
            .unpack_in(dest)
            .map_err(|e| Error::ExtractFailed(format!("unpack entry: {e}")))?;
    }

    Ok(())
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::ExtractFailed(format!("read zip {}: {e}", archive.display())))?;
    zip.extract(dest)
        .map_err(|e| Error::ExtractFailed(format!("unzip {}: {e}", archive.display())))
}

fn unpack_bare_gzip(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::ExtractFailed("gzip archive has no filename".to_string()))?;
    let out_name = name.strip_suffix(".gz").unwrap_or(name);
    let out_path = dest.join(out_name);

    let file = File::open(archive)
        .map_err(|e| Error::ExtractFailed(format!("open {}: {e}", archive.display())))?;
    let mut decoder = GzDecoder::new(file);
    let mut out = File::create(&out_path)
        .map_err(|e| Error::ExtractFailed(format!("create {}: {e}", out_path.display())))?;

    io::copy(&mut decoder, &mut out)
        .map_err(|e| Error::ExtractFailed(format!("decompress {}: {e}", archive.display())))?;
    Ok(())
}

/// Apply patches in recipe order. Each patch is dry-run at strip level 1,
/// then 0; the first level whose dry-run passes is applied for real.
pub fn apply_patches(source_dir: &Path, patches: &[PathBuf]) -> Result<()> {
    for patch in patches {
        if !patch.exists() {
            return Err(Error::PatchRejected(format!(
                "patch file not found: {}",
                patch.display()
            )));
        }

        let level = [1u32, 0]
            .into_iter()
            .find(|level| patch_dry_run(source_dir, patch, *level).unwrap_or(false));

        match level {
            Some(level) => {
                info!(patch = %patch.display(), level, "applying patch");
                run_patch(source_dir, patch, level, false)?;
            }
            None => {
                return Err(Error::PatchRejected(
                    patch
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("patch")
                        .to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn patch_dry_run(source_dir: &Path, patch: &Path, level: u32) -> Result<bool> {
    run_patch(source_dir, patch, level, true).map(|_| true).or(Ok(false))
}

fn run_patch(source_dir: &Path, patch: &Path, level: u32, dry_run: bool) -> Result<()> {
    let mut cmd = Command::new("patch");
    cmd.arg(format!("-p{level}"))
        .arg("-i")
        .arg(patch)
        .current_dir(source_dir);
    if dry_run {
        cmd.arg("--dry-run");
    }

    let output = cmd
        .output()
        .map_err(|e| Error::PatchRejected(format!("spawn patch: {e}")))?;

    if !output.status.success() {
        return Err(Error::PatchRejected(format!(
            "{} (-p{level}): {}",
            patch.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_tar_gz(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (file_name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, file_name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn make_bare_gz(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(contents).unwrap();
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn test_detect_tar_gz_by_content() {
        let tmp = TempDir::new().unwrap();
        // Deliberately misleading extension: content sniffing must win.
        let archive = make_tar_gz(tmp.path(), "mystery.bin", &[("a.txt", "hello")]);
        assert_eq!(detect_kind(&archive).unwrap(), ArchiveKind::TarGzip);
    }

    #[test]
    fn test_detect_bare_gzip() {
        let tmp = TempDir::new().unwrap();
        let archive = make_bare_gz(tmp.path(), "notes.txt.gz", b"just text");
        assert_eq!(detect_kind(&archive).unwrap(), ArchiveKind::Gzip);
    }

    #[test]
    fn test_detect_unknown_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("garbage.bin");
        std::fs::write(&path, b"\x00\x01\x02\x03 nothing recognizable").unwrap();
        assert!(detect_kind(&path).is_err());
    }

    #[test]
    fn test_extract_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let archive = make_tar_gz(
            tmp.path(),
            "src.tar.gz",
            &[("pkg-1.0/README", "docs"), ("pkg-1.0/main.c", "int main;")],
        );

        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("pkg-1.0/README")).unwrap(),
            "docs"
        );
    }

    #[test]
    fn test_extract_bare_gzip_strips_suffix() {
        let tmp = TempDir::new().unwrap();
        let archive = make_bare_gz(tmp.path(), "config.sh.gz", b"#!/bin/sh\n");

        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert_eq!(
            std::fs::read(dest.join("config.sh")).unwrap(),
            b"#!/bin/sh\n"
        );
    }

    #[test]
    fn test_extract_plain_tar() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("src.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f", &b"ok"[..]).unwrap();
        builder.into_inner().unwrap();

        let dest = tmp.path().join("out");
        extract(&path, &dest).unwrap();
        assert!(dest.join("f").exists());
    }

    #[test]
    fn test_extract_zip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("src.zip");
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("inner.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"zipped").unwrap();
        zip.finish().unwrap();

        let dest = tmp.path().join("out");
        extract(&path, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("inner.txt")).unwrap(), b"zipped");
    }

    fn patch_available() -> bool {
        Command::new("patch")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_apply_patch_strip_ladder() {
        if !patch_available() {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("hello.txt"), "old line\n").unwrap();

        // Paths carry an a/ b/ prefix, so -p1 is the right strip level.
        let patch_file = tmp.path().join("fix.patch");
        std::fs::write(
            &patch_file,
            "--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-old line\n+new line\n",
        )
        .unwrap();

        apply_patches(&src, &[patch_file]).unwrap();
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "new line\n"
        );
    }

    #[test]
    fn test_apply_patch_p0_fallback() {
        if !patch_available() {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("hello.txt"), "old line\n").unwrap();

        // No prefix: -p1 dry-run fails, -p0 succeeds.
        let patch_file = tmp.path().join("fix.patch");
        std::fs::write(
            &patch_file,
            "--- hello.txt\n+++ hello.txt\n@@ -1 +1 @@\n-old line\n+new line\n",
        )
        .unwrap();

        apply_patches(&src, &[patch_file]).unwrap();
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "new line\n"
        );
    }

    #[test]
    fn test_rejected_patch() {
        if !patch_available() {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("hello.txt"), "something else entirely\n").unwrap();

        let patch_file = tmp.path().join("bad.patch");
        std::fs::write(
            &patch_file,
            "--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-old line\n+new line\n",
        )
        .unwrap();

        let err = apply_patches(&src, &[patch_file]).unwrap_err();
        assert!(matches!(err, Error::PatchRejected(_)));
        // Source untouched after rejection
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "something else entirely\n"
        );
    }
}
