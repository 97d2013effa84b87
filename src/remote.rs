//! Replicating a coordinator-side install to worker hosts over SSH.
//!
//! Each worker is brought to the same installed state as the coordinator:
//! the install-root tree is created, the persisted configuration record and
//! any locally-installed package directories are copied over, and the
//! provisioning tool is invoked remotely for the worker's own build. Workers
//! are independent; one host's failure lands in its own report entry and
//! never aborts the others.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use log::{info, warn};

use spurs::{cmd, Execute, SshShell};

use crate::config::{ClusterConfig, WorkerSpec};
use crate::error::ProvisionError;

/// How many workers are replicated to at once.
const MAX_PARALLEL_REPLICATIONS: usize = 4;

const SSH_PORT: u16 = 22;

/// The remote shell and file-transfer channel to one worker host.
pub trait RemoteSession {
    fn host(&self) -> &str;
    /// Create a directory tree; succeeding when it already exists.
    fn mkdir_p(&self, path: &str) -> Result<(), failure::Error>;
    fn exists(&self, path: &str) -> Result<bool, failure::Error>;
    fn copy_file(&self, local: &Path, remote: &str) -> Result<(), failure::Error>;
    fn copy_dir(&self, local: &Path, remote: &str) -> Result<(), failure::Error>;
    /// Run a command remotely, returning its stdout.
    fn run(&self, command: &str) -> Result<String, failure::Error>;
}

/// Production session: spurs for remote commands, `scp` for transfers.
pub struct SshSession {
    host: String,
    user: String,
    shell: SshShell,
}

impl SshSession {
    pub fn connect(host: &str, user: Option<&str>) -> Result<Self, failure::Error> {
        let user = match user {
            Some(user) => user.to_owned(),
            None => std::env::var("USER").unwrap_or_else(|_| "root".into()),
        };

        info!("opening SSH session to {}@{}", user, host);
        let shell = SshShell::with_default_key(&user, (host, SSH_PORT))
            .map_err(|e| ProvisionError::remote(host, e))?;

        Ok(SshSession {
            host: host.to_owned(),
            user,
            shell,
        })
    }

    fn scp(&self, recursive: bool, local: &Path, remote: &str) -> Result<(), failure::Error> {
        let mut scp = Command::new("scp");
        scp.arg("-q").arg("-o").arg("ConnectTimeout=30");
        if recursive {
            scp.arg("-r");
        }
        scp.arg(local)
            .arg(format!("{}@{}:{}", self.user, self.host, remote));

        let output = scp
            .output()
            .map_err(|e| ProvisionError::remote(&self.host, e))?;
        if !output.status.success() {
            return Err(ProvisionError::remote(
                &self.host,
                format!(
                    "scp of {} to {} failed: {}",
                    local.display(),
                    remote,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(())
    }
}

impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn mkdir_p(&self, path: &str) -> Result<(), failure::Error> {
        self.shell
            .run(cmd!("mkdir -p {}", path))
            .map_err(|e| ProvisionError::remote(&self.host, e))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, failure::Error> {
        let out = self
            .shell
            .run(cmd!("test -e {} && echo exists || echo missing", path).use_bash())
            .map_err(|e| ProvisionError::remote(&self.host, e))?;
        Ok(out.stdout.trim() == "exists")
    }

    fn copy_file(&self, local: &Path, remote: &str) -> Result<(), failure::Error> {
        self.scp(false, local, remote)
    }

    fn copy_dir(&self, local: &Path, remote: &str) -> Result<(), failure::Error> {
        self.scp(true, local, remote)
    }

    fn run(&self, command: &str) -> Result<String, failure::Error> {
        let out = self
            .shell
            .run(cmd!("{}", command).use_bash())
            .map_err(|e| ProvisionError::remote(&self.host, e))?;
        Ok(out.stdout)
    }
}

/// The per-host outcome of a replication run.
pub struct HostReport {
    pub host: String,
    pub outcome: Result<(), failure::Error>,
}

/// Bring one worker host to the coordinator's installed state through an
/// already-open session.
pub fn replicate_with_session(
    config: &ClusterConfig,
    session: &dyn RemoteSession,
) -> Result<(), failure::Error> {
    let host = session.host();
    info!("replicating environment '{}' to {}", config.name, host);

    session.mkdir_p(&config.environment_dir())?;
    session.mkdir_p(&config.libs_dir())?;
    session.mkdir_p(&config.activate_dir())?;

    let record = config.config_json_path();
    if !Path::new(&record).exists() {
        return Err(ProvisionError::filesystem(
            &record,
            "configuration record not found locally; run the coordinator build first",
        ));
    }
    session.copy_file(Path::new(&record), &record)?;

    // Pre-stage whatever is already installed locally so the worker build
    // hits the installer's idempotency guard instead of re-downloading.
    for pkg in config.archive_packages() {
        let install_dir = config.install_dir(&pkg.name)?;
        if !Path::new(&install_dir).exists() {
            warn!(
                "package {} not installed locally at {}, worker {} will download it",
                pkg.name, install_dir, host
            );
            continue;
        }
        if session.exists(&install_dir)? {
            info!("{} already present on {} at {}", pkg.name, host, install_dir);
            continue;
        }
        session.mkdir_p(&config.package_family_dir(&pkg.name))?;
        session.copy_dir(Path::new(&install_dir), &install_dir)?;
    }

    session.run("command -v sparkstrap >/dev/null 2>&1 || cargo install sparkstrap")?;
    session.run(&format!(
        "sparkstrap worker {} --config {}",
        host, record
    ))?;

    Ok(())
}

/// Open a session to one worker and replicate to it.
pub fn replicate_to_worker(
    config: &ClusterConfig,
    worker: &WorkerSpec,
) -> Result<(), failure::Error> {
    let session = SshSession::connect(&worker.host, worker.ssh_user.as_deref())?;
    replicate_with_session(config, &session)
}

/// Replicate to every non-coordinator worker host with bounded parallelism,
/// collecting an independent result per host.
pub fn replicate_to_workers(config: &ClusterConfig) -> Vec<HostReport> {
    let workers: Vec<WorkerSpec> = config
        .workers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|w| !config.is_driver(&w.host))
        .collect();

    replicate_to_workers_with(&workers, |worker| replicate_to_worker(config, worker))
}

fn replicate_to_workers_with<F>(workers: &[WorkerSpec], replicate: F) -> Vec<HostReport>
where
    F: Fn(&WorkerSpec) -> Result<(), failure::Error> + Sync,
{
    let results = Mutex::new(Vec::new());

    for chunk in workers.chunks(MAX_PARALLEL_REPLICATIONS) {
        let scope_result = crossbeam::thread::scope(|scope| {
            for worker in chunk {
                let results = &results;
                let replicate = &replicate;
                scope.spawn(move |_| {
                    let outcome = replicate(worker);
                    results.lock().unwrap().push(HostReport {
                        host: worker.host.clone(),
                        outcome,
                    });
                });
            }
        });

        // A panicked thread never pushed its report; record it as that
        // host's failure instead of aborting the remaining hosts.
        if scope_result.is_err() {
            let mut results = results
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for worker in chunk {
                if !results.iter().any(|r| r.host == worker.host) {
                    results.push(HostReport {
                        host: worker.host.clone(),
                        outcome: Err(ProvisionError::remote(
                            &worker.host,
                            "replication thread panicked",
                        )),
                    });
                }
            }
        }
    }

    results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
