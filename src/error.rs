//! The error taxonomy for the provisioning pipeline.
//!
//! Every task-level failure aborts the rest of that host's pipeline. Remote
//! errors are scoped to a single worker's replication and are collected into
//! a per-host report instead of escalating.

use failure::Fail;

#[derive(Debug, Fail)]
pub enum ProvisionError {
    /// The configuration itself is invalid (unknown package name, metastore
    /// referencing an unregistered connector, a host missing from the worker
    /// list, ...). Always fatal, raised before any filesystem mutation where
    /// possible.
    #[fail(display = "configuration error: {}", msg)]
    Config { msg: String },

    /// A download failed.
    #[fail(display = "download failed for {}: {}", url, msg)]
    Fetch { url: String, msg: String },

    /// An archive could not be extracted or had an unexpected layout.
    #[fail(display = "archive error for {}: {}", path, msg)]
    Archive { path: String, msg: String },

    /// A local filesystem operation failed.
    #[fail(display = "filesystem error at {}: {}", path, msg)]
    Filesystem { path: String, msg: String },

    /// A remote session operation failed. Fatal for that worker only.
    #[fail(display = "remote error on host {}: {}", host, msg)]
    Remote { host: String, msg: String },
}

impl ProvisionError {
    pub fn config(msg: impl AsRef<str>) -> failure::Error {
        ProvisionError::Config {
            msg: msg.as_ref().to_owned(),
        }
        .into()
    }

    pub fn fetch(url: impl AsRef<str>, msg: impl std::fmt::Display) -> failure::Error {
        ProvisionError::Fetch {
            url: url.as_ref().to_owned(),
            msg: msg.to_string(),
        }
        .into()
    }

    pub fn archive(path: impl AsRef<str>, msg: impl std::fmt::Display) -> failure::Error {
        ProvisionError::Archive {
            path: path.as_ref().to_owned(),
            msg: msg.to_string(),
        }
        .into()
    }

    pub fn filesystem(path: impl AsRef<str>, msg: impl std::fmt::Display) -> failure::Error {
        ProvisionError::Filesystem {
            path: path.as_ref().to_owned(),
            msg: msg.to_string(),
        }
        .into()
    }

    pub fn remote(host: impl AsRef<str>, msg: impl std::fmt::Display) -> failure::Error {
        ProvisionError::Remote {
            host: host.as_ref().to_owned(),
            msg: msg.to_string(),
        }
        .into()
    }
}
