// src/fetch/mod.rs

//! Source acquisition: URLs with mirrors, and git repositories
//!
//! Artifacts land in the per-package sources cache and are verified against
//! declared checksums. Partial or mismatching files are never left in the
//! cache; they move to quarantine so retries start clean.

mod git;

pub use git::GitFetcher;

use crate::error::{Error, Result};
use crate::hash;
use crate::layout::Layout;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Buffer size for streaming downloads
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A successfully fetched source
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub path: PathBuf,
    /// Verified SHA-256, when the declared checksum was SHA-256
    pub sha256: Option<String>,
}

/// Fetcher options for one run
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Re-download even when the cached artifact verifies.
    pub update: bool,
    /// Refresh existing git checkouts instead of reusing them as-is.
    pub git_update: bool,
}

/// Downloads source artifacts into the cache with retry and verification
pub struct Fetcher {
    layout: Arc<Layout>,
    client: reqwest::blocking::Client,
    /// Download attempts per URL (primary or mirror)
    attempts: u32,
    /// Initial backoff between attempts; doubles each time
    backoff: Duration,
}

impl Fetcher {
    pub fn new(layout: Arc<Layout>, backoff: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("smelt/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::FetchFailed(format!("create HTTP client: {e}")))?;

        Ok(Self {
            layout,
            client,
            attempts: 3,
            backoff,
        })
    }

    /// Fetch one URL into the package's sources cache.
    ///
    /// Cache policy: an existing file with a matching checksum is reused; a
    /// mismatching one is quarantined and re-downloaded; without a declared
    /// checksum, presence counts as success. The primary URL and each mirror
    /// get up to `attempts` tries with exponential backoff; a download whose
    /// checksum mismatches is quarantined and the next mirror is tried.
    pub fn fetch_url(
        &self,
        pkg: &str,
        url: &str,
        checksum: Option<&str>,
        mirrors: &[String],
        options: &FetchOptions,
    ) -> Result<FetchedSource> {
        let cache_dir = self.layout.sources(pkg);
        fs::create_dir_all(&cache_dir)
            .map_err(|e| Error::IoError(format!("create sources cache: {e}")))?;

        let filename = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::FetchFailed(format!("no filename in url {url}")))?;
        let dest = cache_dir.join(filename);

        // Refuse unverifiable checksums up front, before any network I/O.
        if let Some(declared) = checksum {
            hash::parse_checksum(declared)?;
        }

        if dest.exists() && !options.update {
            match checksum {
                Some(declared) => match hash::verify_file(&dest, declared) {
                    Ok(_) => {
                        debug!(pkg, file = filename, "cache hit, checksum verified");
                        return Ok(self.verified(&dest, checksum)?);
                    }
                    Err(Error::ChecksumMismatch { .. }) => {
                        warn!(pkg, file = filename, "cached file mismatches, re-fetching");
                        self.layout.corrupted_quarantine(&dest)?;
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    debug!(pkg, file = filename, "cache hit (no checksum declared)");
                    return Ok(FetchedSource {
                        path: dest,
                        sha256: None,
                    });
                }
            }
        } else if dest.exists() {
            // --update: force a fresh download
            fs::remove_file(&dest)
                .map_err(|e| Error::IoError(format!("remove stale {}: {e}", dest.display())))?;
        }

        let mut candidates: Vec<&str> = Vec::with_capacity(1 + mirrors.len());
        candidates.push(url);
        candidates.extend(mirrors.iter().map(String::as_str));

        let mut last_error: Option<Error> = None;

        for candidate in candidates {
            match self.download_with_retry(candidate, &dest) {
                Ok(()) => match checksum {
                    Some(declared) => match hash::verify_file(&dest, declared) {
                        Ok(_) => {
                            info!(pkg, url = candidate, "fetched and verified");
                            return self.verified(&dest, checksum);
                        }
                        Err(e @ Error::ChecksumMismatch { .. }) => {
                            warn!(pkg, url = candidate, "checksum mismatch, trying next mirror");
                            self.layout.corrupted_quarantine(&dest)?;
                            last_error = Some(e);
                        }
                        Err(e) => return Err(e),
                    },
                    None => {
                        info!(pkg, url = candidate, "fetched (no checksum declared)");
                        return Ok(FetchedSource {
                            path: dest,
                            sha256: None,
                        });
                    }
                },
                Err(e) => {
                    warn!(pkg, url = candidate, error = %e, "download failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e @ Error::ChecksumMismatch { .. }) => Err(e),
            _ => Err(Error::AllMirrorsFailed {
                url: url.to_string(),
            }),
        }
    }

    fn verified(&self, dest: &Path, checksum: Option<&str>) -> Result<FetchedSource> {
        // State records carry SHA-256; recompute when the declared checksum
        // was a different algorithm.
        let sha256 = match checksum {
            Some(_) => Some(hash::sha256_file(dest)?),
            None => None,
        };
        Ok(FetchedSource {
            path: dest.to_path_buf(),
            sha256,
        })
    }

    /// Up to `attempts` tries against one URL, exponential backoff between.
    fn download_with_retry(&self, url: &str, dest: &Path) -> Result<()> {
        let mut delay = self.backoff;
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                debug!(url, attempt, "retrying after {:?}", delay);
                std::thread::sleep(delay);
                delay *= 2;
            }

            match self.download_once(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::FetchFailed(format!("download {url}"))))
    }

    /// One download attempt. Data streams into `<dest>.part`; only a
    /// complete download is renamed into place, and a failed partial is
    /// quarantined rather than left behind.
    fn download_once(&self, url: &str, dest: &Path) -> Result<()> {
        let part = dest.with_extension(format!(
            "{}.part",
            dest.extension().and_then(|e| e.to_str()).unwrap_or("dl")
        ));

        let result = if let Some(local) = url.strip_prefix("file://") {
            copy_local(Path::new(local), &part)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.download_http(url, &part)
        } else {
            Err(Error::FetchFailed(format!("unsupported URL scheme: {url}")))
        };

        match result {
            Ok(()) => {
                fs::rename(&part, dest)
                    .map_err(|e| Error::IoError(format!("finalize {}: {e}", dest.display())))?;
                Ok(())
            }
            Err(e) => {
                if part.exists() {
                    let _ = self.layout.corrupted_quarantine(&part);
                }
                Err(e)
            }
        }
    }

    fn download_http(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::FetchFailed(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::FetchFailed(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let mut file = File::create(dest)
            .map_err(|e| Error::IoError(format!("create {}: {e}", dest.display())))?;

        stream_to_file(response, &mut file)?;
        file.sync_all()
            .map_err(|e| Error::IoError(format!("sync {}: {e}", dest.display())))?;
        Ok(())
    }
}

/// Stream a response body to a file in fixed-size chunks, never buffering
/// the whole body in memory.
fn stream_to_file(mut response: impl Read, file: &mut File) -> Result<()> {
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = response
            .read(&mut buffer)
            .map_err(|e| Error::FetchFailed(format!("read response: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .map_err(|e| Error::IoError(format!("write download: {e}")))?;
    }
    Ok(())
}

fn copy_local(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        return Err(Error::FetchFailed(format!(
            "local source {} does not exist",
            src.display()
        )));
    }
    fs::copy(src, dest).map_err(|e| {
        Error::FetchFailed(format!("copy {} -> {}: {e}", src.display(), dest.display()))
    })?;
    Ok(())
}
