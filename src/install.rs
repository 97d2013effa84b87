//! Downloading, extracting, and relocating pinned runtime archives.
//!
//! The installer is the one idempotent guard in the pipeline: if the
//! canonical install directory already exists the task returns without any
//! network access, which is what lets repeated builds and worker replication
//! (packages pre-staged from the driver) skip redundant downloads.

use std::fs;
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use log::info;
use tar::Archive;

use crate::error::ProvisionError;
use crate::packages;
use crate::tasks::{BuildContext, Task};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// The artifact-download collaborator. Separated from the installer so tests
/// can count calls and stage fixture archives.
pub trait Fetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), failure::Error>;
}

/// Blocking HTTP fetcher with explicit connect and overall timeouts so a
/// hung download cannot block a build indefinitely.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, failure::Error> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ProvisionError::fetch("<client>", e))?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), failure::Error> {
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProvisionError::fetch(url, e))?;

        let mut file = fs::File::create(dest)
            .map_err(|e| ProvisionError::filesystem(dest.display().to_string(), e))?;
        response
            .copy_to(&mut file)
            .map_err(|e| ProvisionError::fetch(url, e))?;

        Ok(())
    }
}

/// Extract a gzipped tarball into `dest` (created fresh) and return the
/// top-level entry names.
pub fn extract_archive(archive_path: &str, dest: &str) -> Result<Vec<String>, failure::Error> {
    if Path::new(dest).exists() {
        fs::remove_dir_all(dest).map_err(|e| ProvisionError::filesystem(dest, e))?;
    }
    fs::create_dir_all(dest).map_err(|e| ProvisionError::filesystem(dest, e))?;

    let file =
        fs::File::open(archive_path).map_err(|e| ProvisionError::filesystem(archive_path, e))?;
    Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(|e| ProvisionError::archive(archive_path, e))?;

    let mut entries = Vec::new();
    for entry in fs::read_dir(dest).map_err(|e| ProvisionError::filesystem(dest, e))? {
        let entry = entry.map_err(|e| ProvisionError::filesystem(dest, e))?;
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();

    Ok(entries)
}

/// Ensure one pinned runtime package is present at its canonical install
/// directory.
#[derive(Debug)]
pub struct InstallPackage {
    pub package: String,
}

impl Task for InstallPackage {
    fn name(&self) -> String {
        format!("install-{}", self.package)
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let config = ctx.config;
        let install_dir = config.install_dir(&self.package)?;

        if Path::new(&install_dir).exists() {
            info!(
                "{} already installed at {}, skipping download",
                self.package, install_dir
            );
            return Ok(());
        }

        let family_dir = config.package_family_dir(&self.package);
        fs::create_dir_all(&family_dir)
            .map_err(|e| ProvisionError::filesystem(&family_dir, e))?;

        let version = config.package_version(&self.package)?;
        let url = packages::download_url(&self.package, version)?;
        let archive_path = config.archive_download_path(&self.package)?;

        info!("downloading {} {} from {}", self.package, version, url);
        ctx.fetcher.fetch(&url, Path::new(&archive_path))?;

        let scratch = config.extract_scratch_dir(&self.package);
        let result = unpack_into_place(&archive_path, &scratch, &install_dir);

        // Scratch state never outlives the task, success or failure. The
        // canonical directory only appears via the final rename.
        let _ = fs::remove_file(&archive_path);
        let _ = fs::remove_dir_all(&scratch);

        result
    }
}

fn unpack_into_place(
    archive_path: &str,
    scratch: &str,
    install_dir: &str,
) -> Result<(), failure::Error> {
    let entries = extract_archive(archive_path, scratch)?;

    if entries.len() != 1 {
        return Err(ProvisionError::archive(
            archive_path,
            format!(
                "expected a single top-level entry, found {}: [{}]",
                entries.len(),
                entries.join(", ")
            ),
        ));
    }

    let extracted = format!("{}/{}", scratch, entries[0]);
    info!("moving unpacked archive from {} to {}", extracted, install_dir);
    fs::rename(&extracted, install_dir).map_err(|e| ProvisionError::filesystem(install_dir, e))
}
