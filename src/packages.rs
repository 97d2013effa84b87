//! The closed registry of known runtime packages.
//!
//! Download URLs, archive file names, and install directory names are all
//! deterministic functions of the package name and pinned version. Asking for
//! an unknown package is a configuration error, never a silent default.

use crate::error::ProvisionError;

/// Packages that install from a downloaded archive, in install order.
pub const ARCHIVE_PACKAGES: &[&str] = &["java", "scala", "spark"];

/// Packages pulled in as jars through the runtime's own package mechanism
/// rather than an archive install.
pub const JAR_PACKAGES: &[&str] = &["delta"];

pub fn is_known(name: &str) -> bool {
    is_archive(name) || JAR_PACKAGES.contains(&name)
}

pub fn is_archive(name: &str) -> bool {
    ARCHIVE_PACKAGES.contains(&name)
}

/// The archive file name for the given package and version.
pub fn archive_file_name(name: &str, version: &str) -> Result<String, failure::Error> {
    match name {
        // Temurin encodes the `+` build separator as `_` in file names.
        "java" => Ok(format!(
            "OpenJDK11U-jdk_x64_linux_hotspot_{}.tar.gz",
            version.replace("+", "_")
        )),
        "scala" => Ok(format!("scala-{}.tgz", version)),
        "spark" => Ok(format!("spark-{}-bin-hadoop3.tgz", version)),
        _ => Err(unknown_package(name)),
    }
}

/// The full download URL for the given package and version.
pub fn download_url(name: &str, version: &str) -> Result<String, failure::Error> {
    let file = archive_file_name(name, version)?;
    match name {
        // Temurin encodes the `+` build separator as `%2B` in release tags.
        "java" => Ok(format!(
            "https://github.com/adoptium/temurin11-binaries/releases/download/jdk-{}/{}",
            version.replace("+", "%2B"),
            file
        )),
        "scala" => Ok(format!(
            "https://downloads.lightbend.com/scala/{}/{}",
            version, file
        )),
        "spark" => Ok(format!(
            "https://archive.apache.org/dist/spark/spark-{}/{}",
            version, file
        )),
        _ => Err(unknown_package(name)),
    }
}

/// The environment variable exporting the package's home directory in the
/// activation script (e.g. `JAVA_HOME`).
pub fn home_var(name: &str) -> Result<String, failure::Error> {
    if is_archive(name) {
        Ok(format!("{}_HOME", name.to_uppercase()))
    } else {
        Err(unknown_package(name))
    }
}

fn unknown_package(name: &str) -> failure::Error {
    ProvisionError::config(format!(
        "unknown package '{}', known packages: {}",
        name,
        ARCHIVE_PACKAGES
            .iter()
            .chain(JAR_PACKAGES)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_stable_across_calls() {
        for &pkg in ARCHIVE_PACKAGES {
            let first = download_url(pkg, "1.2.3").unwrap();
            let second = download_url(pkg, "1.2.3").unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn java_version_encoding() {
        let url = download_url("java", "11.0.21+9").unwrap();
        assert!(url.contains("jdk-11.0.21%2B9"));
        assert!(url.ends_with("OpenJDK11U-jdk_x64_linux_hotspot_11.0.21_9.tar.gz"));
    }

    #[test]
    fn spark_dist_name() {
        assert_eq!(
            archive_file_name("spark", "3.5.2").unwrap(),
            "spark-3.5.2-bin-hadoop3.tgz"
        );
    }

    #[test]
    fn unknown_package_is_an_error() {
        assert!(download_url("hadoop", "3.3.1").is_err());
        assert!(archive_file_name("nope", "1").is_err());
        assert!(home_var("delta").is_err());
    }
}
