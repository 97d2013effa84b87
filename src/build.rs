//! Role-aware assembly and execution of the provisioning task pipeline.
//!
//! A build invocation picks exactly one role; `resolve_tasks` is a pure
//! function from (config, role, host) to the ordered task list, so each
//! role's pipeline is unit-testable without touching the filesystem.

use log::info;

use crate::config::{ClusterConfig, DeployMode, WorkerSpec};
use crate::error::ProvisionError;
use crate::install::InstallPackage;
use crate::tasks::{
    BuildContext, Task, WriteActivationScript, WriteCoordinatorConfig, WriteDeltaConfig,
    WriteEnvScript, WriteExtraJars, WriteMetastoreDescriptor, WriteWorkerEnv,
};

/// The deployment role this host plays for one build invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SingleNode,
    ClusterCoordinator,
    ClusterWorker,
}

/// Pick the role for `host` from the configuration's mode and host identity.
pub fn role_for_host(config: &ClusterConfig, host: &str) -> Role {
    match config.mode {
        DeployMode::SingleNode => Role::SingleNode,
        DeployMode::Cluster => {
            if config.is_driver(host) {
                Role::ClusterCoordinator
            } else {
                Role::ClusterWorker
            }
        }
    }
}

/// Resolve the ordered task list for the given role and target host.
pub fn resolve_tasks(
    config: &ClusterConfig,
    role: Role,
    host: &str,
) -> Result<Vec<Box<dyn Task>>, failure::Error> {
    let mut tasks = core_tasks(config, host);

    match role {
        Role::SingleNode => {
            tasks.push(Box::new(WriteCoordinatorConfig));
            // The one host is always both coordinator and sole worker.
            tasks.push(Box::new(WriteWorkerEnv {
                worker: colocated_worker(config),
            }));
            tasks.extend(optional_tasks(config));
            tasks.push(Box::new(WriteActivationScript));
        }

        Role::ClusterCoordinator => {
            tasks.push(Box::new(WriteCoordinatorConfig));
            if let Some(worker) = config.worker_for_host(host) {
                tasks.push(Box::new(WriteWorkerEnv {
                    worker: worker.clone(),
                }));
            }
            tasks.extend(optional_tasks(config));
            tasks.push(Box::new(WriteActivationScript));
        }

        Role::ClusterWorker => {
            let worker = config.worker_for_host(host).ok_or_else(|| {
                ProvisionError::config(format!(
                    "host '{}' is not listed in workers[]",
                    host
                ))
            })?;
            tasks.push(Box::new(WriteWorkerEnv {
                worker: worker.clone(),
            }));
            tasks.push(Box::new(WriteActivationScript));
        }
    }

    Ok(tasks)
}

/// Install every pinned archive package, then create the environment script.
fn core_tasks(config: &ClusterConfig, host: &str) -> Vec<Box<dyn Task>> {
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    for pkg in config.archive_packages() {
        tasks.push(Box::new(InstallPackage {
            package: pkg.name.clone(),
        }));
    }
    tasks.push(Box::new(WriteEnvScript { host: host.into() }));
    tasks
}

/// Coordinator-only optional tasks, included by pure predicates over the
/// configuration.
fn optional_tasks(config: &ClusterConfig) -> Vec<Box<dyn Task>> {
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    if config.metastore.is_some() {
        tasks.push(Box::new(WriteMetastoreDescriptor));
    }
    let has_jdbc_drivers = config
        .jdbc_drivers
        .as_ref()
        .map(|drivers| !drivers.is_empty())
        .unwrap_or(false);
    // The jars task carries the delta coordinate too, so delta alone pulls
    // it in.
    if has_jdbc_drivers || config.has_package("delta") {
        tasks.push(Box::new(WriteExtraJars));
    }
    if config.has_package("delta") {
        tasks.push(Box::new(WriteDeltaConfig));
    }
    tasks
}

/// The worker spec for the co-located single-node worker: the entry naming
/// the driver host if there is one, otherwise synthesized from the driver's
/// own resources.
fn colocated_worker(config: &ClusterConfig) -> WorkerSpec {
    config
        .worker_for_host(&config.driver.host)
        .cloned()
        .unwrap_or_else(|| WorkerSpec {
            host: config.driver.host.clone(),
            cores: config.driver.cores,
            memory: config.driver.memory.clone(),
            instances: None,
            ssh_user: None,
        })
}

/// Run the full pipeline for one host: validate, persist the canonical
/// configuration record, then execute each task in order, fail-fast.
pub fn build_for_role(
    ctx: &BuildContext<'_>,
    role: Role,
    host: &str,
) -> Result<(), failure::Error> {
    let config = ctx.config;
    config.validate()?;

    let record_path = config.config_json_path();
    info!("persisting configuration record at {}", record_path);
    config.write_json(&record_path)?;

    let tasks = resolve_tasks(config, role, host)?;
    for task in tasks {
        info!("running build task: {}", task.name());
        task.run(ctx)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::config::{MavenArtifact, MetastoreSpec, PackageSpec};
    use crate::install::Fetcher;

    use std::collections::BTreeMap;
    use std::path::Path;

    fn task_names(tasks: &[Box<dyn Task>]) -> Vec<String> {
        tasks.iter().map(|t| t.name()).collect()
    }

    fn cluster_config() -> crate::config::ClusterConfig {
        let mut config = minimal("/opt/sparkstrap");
        config.mode = DeployMode::Cluster;
        config.workers = Some(vec![WorkerSpec {
            host: "10.0.0.2".into(),
            cores: Some(4),
            memory: Some("8g".into()),
            instances: Some(2),
            ssh_user: None,
        }]);
        config
    }

    fn with_optionals(mut config: crate::config::ClusterConfig) -> crate::config::ClusterConfig {
        let mut drivers = BTreeMap::new();
        drivers.insert(
            "postgres".to_owned(),
            MavenArtifact {
                group_id: "org.postgresql".into(),
                artifact_id: "postgresql".into(),
                version: "42.7.4".into(),
            },
        );
        config.jdbc_drivers = Some(drivers);
        config.metastore = Some(MetastoreSpec {
            connector_artifact: "postgres".into(),
            db_host: "10.0.0.9".into(),
            db_port: 5432,
            db_user: "hive".into(),
            db_pass: "secret".into(),
        });
        config.packages.push(PackageSpec {
            name: "delta".into(),
            version: "3.2.0".into(),
        });
        config
    }

    #[test]
    fn coordinator_scenario_task_list() {
        let config = cluster_config();
        let tasks = resolve_tasks(&config, Role::ClusterCoordinator, "10.0.0.1").unwrap();
        assert_eq!(
            task_names(&tasks),
            vec![
                "install-java",
                "install-scala",
                "install-spark",
                "write-env-script (10.0.0.1)",
                "write-coordinator-config",
                "write-activation-script",
            ]
        );
    }

    #[test]
    fn worker_scenario_task_list() {
        let config = cluster_config();
        let tasks = resolve_tasks(&config, Role::ClusterWorker, "10.0.0.2").unwrap();
        assert_eq!(
            task_names(&tasks),
            vec![
                "install-java",
                "install-scala",
                "install-spark",
                "write-env-script (10.0.0.2)",
                "write-worker-env (10.0.0.2)",
                "write-activation-script",
            ]
        );
    }

    #[test]
    fn worker_role_never_gets_coordinator_only_tasks() {
        // Even with metastore, jdbc drivers, and delta all configured.
        let config = with_optionals(cluster_config());
        let tasks = resolve_tasks(&config, Role::ClusterWorker, "10.0.0.2").unwrap();
        for name in task_names(&tasks) {
            assert!(!name.contains("coordinator"), "unexpected task {}", name);
            assert!(!name.contains("metastore"), "unexpected task {}", name);
            assert!(!name.contains("extra-jars"), "unexpected task {}", name);
            assert!(!name.contains("delta"), "unexpected task {}", name);
        }
    }

    #[test]
    fn coordinator_includes_optionals_when_configured() {
        let config = with_optionals(cluster_config());
        let names = task_names(&resolve_tasks(&config, Role::ClusterCoordinator, "10.0.0.1").unwrap());
        assert!(names.contains(&"write-metastore-descriptor".to_owned()));
        assert!(names.contains(&"write-extra-jars".to_owned()));
        assert!(names.contains(&"write-delta-config".to_owned()));
    }

    #[test]
    fn single_node_has_exactly_one_worker_env_bound_to_driver_host() {
        // Workers list does not name the driver: the spec is synthesized.
        let config = minimal("/opt/sparkstrap");
        let names = task_names(&resolve_tasks(&config, Role::SingleNode, "10.0.0.1").unwrap());
        let worker_tasks: Vec<_> = names
            .iter()
            .filter(|n| n.starts_with("write-worker-env"))
            .collect();
        assert_eq!(worker_tasks, vec!["write-worker-env (10.0.0.1)"]);

        // Workers list naming the driver host: that entry is used, still
        // exactly once.
        let mut config = minimal("/opt/sparkstrap");
        config.workers = Some(vec![WorkerSpec {
            host: "10.0.0.1".into(),
            cores: Some(2),
            memory: Some("4g".into()),
            instances: Some(1),
            ssh_user: None,
        }]);
        let names = task_names(&resolve_tasks(&config, Role::SingleNode, "10.0.0.1").unwrap());
        let worker_tasks: Vec<_> = names
            .iter()
            .filter(|n| n.starts_with("write-worker-env"))
            .collect();
        assert_eq!(worker_tasks, vec!["write-worker-env (10.0.0.1)"]);
    }

    #[test]
    fn delta_alone_pulls_in_the_jars_task() {
        let mut config = cluster_config();
        config.packages.push(PackageSpec {
            name: "delta".into(),
            version: "3.2.0".into(),
        });
        let names = task_names(&resolve_tasks(&config, Role::ClusterCoordinator, "10.0.0.1").unwrap());
        assert!(names.contains(&"write-extra-jars".to_owned()));
        assert!(names.contains(&"write-delta-config".to_owned()));
    }

    #[test]
    fn failed_install_aborts_the_rest_of_the_pipeline() {
        struct FailingFetcher;

        impl Fetcher for FailingFetcher {
            fn fetch(&self, url: &str, _dest: &Path) -> Result<(), failure::Error> {
                Err(ProvisionError::fetch(url, "unreachable"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = minimal(dir.path().to_str().unwrap());
        let ctx = BuildContext {
            config: &config,
            fetcher: &FailingFetcher,
        };

        assert!(build_for_role(&ctx, Role::SingleNode, "10.0.0.1").is_err());

        // The first install failed, so none of the writer tasks ran.
        assert!(!Path::new(&config.env_script_path().unwrap()).exists());
        assert!(!Path::new(&config.defaults_path().unwrap()).exists());
        assert!(!Path::new(&config.activation_script_path()).exists());
    }

    #[test]
    fn worker_role_requires_listed_host() {
        let config = cluster_config();
        let err = resolve_tasks(&config, Role::ClusterWorker, "10.9.9.9").unwrap_err();
        assert!(err.to_string().contains("not listed in workers[]"));
    }

    #[test]
    fn role_for_host_dispatch() {
        let config = cluster_config();
        assert_eq!(role_for_host(&config, "10.0.0.1"), Role::ClusterCoordinator);
        assert_eq!(role_for_host(&config, "10.0.0.2"), Role::ClusterWorker);

        let single = minimal("/opt/sparkstrap");
        assert_eq!(role_for_host(&single, "10.0.0.1"), Role::SingleNode);
    }

    #[test]
    fn cluster_coordinator_colocated_as_worker() {
        let mut config = cluster_config();
        config
            .workers
            .as_mut()
            .unwrap()
            .push(WorkerSpec {
                host: "10.0.0.1".into(),
                cores: Some(2),
                memory: None,
                instances: None,
                ssh_user: None,
            });
        let names = task_names(&resolve_tasks(&config, Role::ClusterCoordinator, "10.0.0.1").unwrap());
        assert!(names.contains(&"write-worker-env (10.0.0.1)".to_owned()));
    }
}
