//! The declarative description of one named cluster environment.
//!
//! A `ClusterConfig` is constructed once from one or more layered JSON
//! definitions, is immutable afterwards, and owns every derived filesystem
//! path. Tasks never compute a path on their own; everything is keyed off the
//! accessors here so repeated builds and worker replication stay in sync.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::packages;

/// How the environment is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployMode {
    /// One host acting as both coordinator and sole worker.
    SingleNode,
    /// A coordinator host plus zero or more worker hosts.
    Cluster,
}

/// A pinned runtime package. The name must be one of the known packages in
/// `packages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

/// The coordinator host and its resource allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSpec {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Names of secondary services the run glue should start alongside the
    /// coordinator (e.g. a thrift server). Recorded here, consumed by the
    /// start/stop commands, not by the build pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_services: Option<Vec<String>>,
}

/// One worker host. A host may appear here and also be the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    /// User to open the replication SSH session as. Falls back to the
    /// invoking user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

/// A maven coordinate for a JDBC driver jar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MavenArtifact {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
}

impl MavenArtifact {
    /// The `group:artifact:version` coordinate understood by
    /// `spark.jars.packages`.
    pub fn coordinate(&self) -> String {
        format!("{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

/// Connection details for an external Hive metastore database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetastoreSpec {
    /// Key into `ClusterConfig::jdbc_drivers` naming the connector jar. Also
    /// selects the JDBC URL scheme and driver class.
    pub connector_artifact: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_pass: String,
}

impl MetastoreSpec {
    pub fn connection_url(&self) -> Result<String, failure::Error> {
        let (scheme, _) = connector_registry(&self.connector_artifact)?;
        Ok(format!(
            "jdbc:{}://{}:{}/metastore_db",
            scheme, self.db_host, self.db_port
        ))
    }

    pub fn driver_class(&self) -> Result<&'static str, failure::Error> {
        let (_, class) = connector_registry(&self.connector_artifact)?;
        Ok(class)
    }
}

/// JDBC URL scheme and driver class for each supported connector.
fn connector_registry(name: &str) -> Result<(&'static str, &'static str), failure::Error> {
    match name {
        "postgres" => Ok(("postgresql", "org.postgresql.Driver")),
        "mysql" => Ok(("mysql", "com.mysql.cj.jdbc.Driver")),
        "mssql" => Ok(("sqlserver", "com.microsoft.sqlserver.jdbc.SQLServerDriver")),
        "oracle" => Ok(("oracle", "oracle.jdbc.OracleDriver")),
        _ => Err(ProvisionError::config(format!(
            "unknown metastore connector '{}', supported: postgres, mysql, mssql, oracle",
            name
        ))),
    }
}

/// The root aggregate: everything needed to build one named environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub install_root: String,
    pub shell_profile_path: String,
    pub mode: DeployMode,
    pub packages: Vec<PackageSpec>,
    pub driver: DriverSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derby_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metastore: Option<MetastoreSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jdbc_drivers: Option<BTreeMap<String, MavenArtifact>>,
}

impl ClusterConfig {
    /// Read one or more JSON definitions and merge them at top-level key
    /// granularity, later files overriding earlier ones.
    pub fn read_layered<P: AsRef<Path>>(paths: &[P]) -> Result<Self, failure::Error> {
        let mut merged = serde_json::Map::new();

        for path in paths {
            let path = path.as_ref();
            let raw = fs::read_to_string(path)
                .map_err(|e| ProvisionError::filesystem(path.display().to_string(), e))?;
            let layer: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                ProvisionError::config(format!("invalid JSON in {}: {}", path.display(), e))
            })?;
            match layer {
                serde_json::Value::Object(map) => merged.extend(map),
                _ => {
                    return Err(ProvisionError::config(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )))
                }
            }
        }

        let config: ClusterConfig = serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(|e| ProvisionError::config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    /// Serialize to the canonical JSON form. Absent optional fields are
    /// omitted.
    pub fn to_json_string(&self) -> Result<String, failure::Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the canonical JSON form to the given path.
    pub fn write_json(&self, path: &str) -> Result<(), failure::Error> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::filesystem(parent.display().to_string(), e))?;
        }
        fs::write(path, self.to_json_string()?)
            .map_err(|e| ProvisionError::filesystem(path, e))
    }

    /// Check the cross-field invariants that must hold before any filesystem
    /// mutation.
    pub fn validate(&self) -> Result<(), failure::Error> {
        for pkg in &self.packages {
            if !packages::is_known(&pkg.name) {
                return Err(ProvisionError::config(format!(
                    "packages[] names unknown package '{}'",
                    pkg.name
                )));
            }
        }

        if let Some(metastore) = &self.metastore {
            connector_registry(&metastore.connector_artifact)?;
            let registered = self
                .jdbc_drivers
                .as_ref()
                .map(|drivers| drivers.contains_key(&metastore.connector_artifact))
                .unwrap_or(false);
            if !registered {
                return Err(ProvisionError::config(format!(
                    "metastore.connector_artifact '{}' is not a key of jdbc_drivers",
                    metastore.connector_artifact
                )));
            }
        }

        Ok(())
    }

    pub fn package_version(&self, name: &str) -> Result<&str, failure::Error> {
        self.packages
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.version.as_str())
            .ok_or_else(|| {
                ProvisionError::config(format!("package '{}' is not listed in packages[]", name))
            })
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }

    /// Archive-installable packages from this configuration, in registry
    /// install order.
    pub fn archive_packages(&self) -> Vec<&PackageSpec> {
        packages::ARCHIVE_PACKAGES
            .iter()
            .filter_map(|name| self.packages.iter().find(|p| &p.name.as_str() == name))
            .collect()
    }

    pub fn is_driver(&self, host: &str) -> bool {
        self.driver.host == host
    }

    pub fn worker_for_host(&self, host: &str) -> Option<&WorkerSpec> {
        self.workers
            .as_ref()
            .and_then(|workers| workers.iter().find(|w| w.host == host))
    }

    // Derived paths. All deterministic functions of (install_root, name,
    // version).

    pub fn libs_dir(&self) -> String {
        format!("{}/libs", self.install_root)
    }

    pub fn package_family_dir(&self, name: &str) -> String {
        format!("{}/{}", self.libs_dir(), name)
    }

    /// The canonical, version-qualified install directory for a package.
    pub fn install_dir(&self, name: &str) -> Result<String, failure::Error> {
        if !packages::is_archive(name) {
            return Err(ProvisionError::config(format!(
                "package '{}' does not install to a directory",
                name
            )));
        }
        let version = self.package_version(name)?;
        Ok(format!("{}/{}", self.package_family_dir(name), version))
    }

    /// Scratch path the package archive is downloaded to.
    pub fn archive_download_path(&self, name: &str) -> Result<String, failure::Error> {
        let file = packages::archive_file_name(name, self.package_version(name)?)?;
        Ok(format!("{}/{}", self.install_root, file))
    }

    /// Scratch directory a package archive is extracted into before the
    /// single top-level entry is moved to the canonical install directory.
    pub fn extract_scratch_dir(&self, name: &str) -> String {
        format!("{}/.extract-{}", self.libs_dir(), name)
    }

    pub fn spark_home(&self) -> Result<String, failure::Error> {
        self.install_dir("spark")
    }

    pub fn spark_conf_dir(&self) -> Result<String, failure::Error> {
        Ok(format!("{}/conf", self.spark_home()?))
    }

    pub fn env_script_path(&self) -> Result<String, failure::Error> {
        Ok(format!("{}/spark-env.sh", self.spark_conf_dir()?))
    }

    pub fn defaults_path(&self) -> Result<String, failure::Error> {
        Ok(format!("{}/spark-defaults.conf", self.spark_conf_dir()?))
    }

    pub fn workers_file_path(&self) -> Result<String, failure::Error> {
        Ok(format!("{}/workers", self.spark_conf_dir()?))
    }

    pub fn metastore_descriptor_path(&self) -> Result<String, failure::Error> {
        Ok(format!("{}/hive-site.xml", self.spark_conf_dir()?))
    }

    pub fn activate_dir(&self) -> String {
        format!("{}/activate", self.install_root)
    }

    pub fn activation_script_path(&self) -> String {
        format!("{}/{}.sh", self.activate_dir(), self.name)
    }

    pub fn environment_dir(&self) -> String {
        format!("{}/environments/{}", self.install_root, self.name)
    }

    /// Where the canonical JSON form is persisted as the record of what was
    /// installed. Read back by worker-side invocations.
    pub fn config_json_path(&self) -> String {
        format!("{}/{}.json", self.environment_dir(), self.name)
    }

    /// A filled-in sample configuration for the `template` subcommand.
    pub fn template(mode: DeployMode) -> Self {
        let packages = vec![
            PackageSpec {
                name: "java".into(),
                version: "11.0.21+9".into(),
            },
            PackageSpec {
                name: "scala".into(),
                version: "2.12.18".into(),
            },
            PackageSpec {
                name: "spark".into(),
                version: "3.5.2".into(),
            },
            PackageSpec {
                name: "delta".into(),
                version: "3.2.0".into(),
            },
        ];

        let workers = match mode {
            DeployMode::SingleNode => None,
            DeployMode::Cluster => Some(vec![WorkerSpec {
                host: "<WORKER-IP-ADDRESS>".into(),
                cores: Some(4),
                memory: Some("8g".into()),
                instances: Some(2),
                ssh_user: None,
            }]),
        };

        let mut jdbc_drivers = BTreeMap::new();
        jdbc_drivers.insert(
            "postgres".to_owned(),
            MavenArtifact {
                group_id: "org.postgresql".into(),
                artifact_id: "postgresql".into(),
                version: "42.7.4".into(),
            },
        );

        ClusterConfig {
            name: "<ENVIRONMENT-NAME>".into(),
            install_root: "<INSTALL-ROOT-DIRECTORY>".into(),
            shell_profile_path: "<PATH-TO-SHELL-PROFILE>".into(),
            mode,
            packages,
            driver: DriverSpec {
                host: "<DRIVER-IP-ADDRESS>".into(),
                cores: Some(4),
                memory: Some("8g".into()),
                enable_services: None,
            },
            workers,
            derby_path: None,
            warehouse_path: Some("<OPTIONAL-WAREHOUSE-DIRECTORY>".into()),
            executor_memory: Some("8g".into()),
            metastore: Some(MetastoreSpec {
                connector_artifact: "postgres".into(),
                db_host: "<DATABASE-IP-ADDRESS>".into(),
                db_port: 5432,
                db_user: "<DATABASE-USERNAME>".into(),
                db_pass: "<DATABASE-PASSWORD>".into(),
            }),
            jdbc_drivers: Some(jdbc_drivers),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn minimal(root: &str) -> ClusterConfig {
        ClusterConfig {
            name: "test".into(),
            install_root: root.into(),
            shell_profile_path: "/home/u/.bashrc".into(),
            mode: DeployMode::SingleNode,
            packages: vec![
                PackageSpec {
                    name: "java".into(),
                    version: "11.0.21+9".into(),
                },
                PackageSpec {
                    name: "scala".into(),
                    version: "2.12.18".into(),
                },
                PackageSpec {
                    name: "spark".into(),
                    version: "3.5.2".into(),
                },
            ],
            driver: DriverSpec {
                host: "10.0.0.1".into(),
                cores: None,
                memory: None,
                enable_services: None,
            },
            workers: None,
            derby_path: None,
            warehouse_path: None,
            executor_memory: None,
            metastore: None,
            jdbc_drivers: None,
        }
    }

    #[test]
    fn round_trip_all_optionals_absent() {
        let config = minimal("/opt/sparkstrap");
        let json = config.to_json_string().unwrap();
        let back: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
        // Absent optionals are omitted from the serialized form.
        assert!(!json.contains("metastore"));
        assert!(!json.contains("derby_path"));
    }

    #[test]
    fn round_trip_all_optionals_present() {
        let config = ClusterConfig::template(DeployMode::Cluster);
        let json = config.to_json_string().unwrap();
        let back: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn install_dir_is_deterministic() {
        let config = minimal("/opt/sparkstrap");
        let first = config.install_dir("spark").unwrap();
        let second = config.install_dir("spark").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "/opt/sparkstrap/libs/spark/3.5.2");
    }

    #[test]
    fn config_json_path_under_environments() {
        let config = minimal("/opt/sparkstrap");
        assert_eq!(
            config.config_json_path(),
            "/opt/sparkstrap/environments/test/test.json"
        );
    }

    #[test]
    fn validate_rejects_unknown_package() {
        let mut config = minimal("/opt/sparkstrap");
        config.packages.push(PackageSpec {
            name: "hadoop".into(),
            version: "3.3.1".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unregistered_connector() {
        let mut config = minimal("/opt/sparkstrap");
        config.metastore = Some(MetastoreSpec {
            connector_artifact: "postgres".into(),
            db_host: "db".into(),
            db_port: 5432,
            db_user: "hive".into(),
            db_pass: "secret".into(),
        });
        // No jdbc_drivers entry for "postgres".
        assert!(config.validate().is_err());

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
        assert!(config.validate().is_ok());
    }

    #[test]
    fn metastore_connection_url() {
        let metastore = MetastoreSpec {
            connector_artifact: "postgres".into(),
            db_host: "10.0.0.9".into(),
            db_port: 5432,
            db_user: "hive".into(),
            db_pass: "secret".into(),
        };
        assert_eq!(
            metastore.connection_url().unwrap(),
            "jdbc:postgresql://10.0.0.9:5432/metastore_db"
        );
        assert_eq!(metastore.driver_class().unwrap(), "org.postgresql.Driver");
    }

    #[test]
    fn layered_read_merges_top_level_keys() {
        let dir = tempfile::tempdir().unwrap();
        let base = minimal(dir.path().to_str().unwrap());

        let base_path = dir.path().join("base.json");
        fs::write(&base_path, base.to_json_string().unwrap()).unwrap();

        let override_path = dir.path().join("override.json");
        fs::write(
            &override_path,
            r#"{"executor_memory": "16g", "name": "layered"}"#,
        )
        .unwrap();

        let merged = ClusterConfig::read_layered(&[&base_path, &override_path]).unwrap();
        assert_eq!(merged.name, "layered");
        assert_eq!(merged.executor_memory.as_deref(), Some("16g"));
        assert_eq!(merged.driver, base.driver);
    }

    #[test]
    fn worker_lookup() {
        let mut config = minimal("/opt/sparkstrap");
        config.workers = Some(vec![WorkerSpec {
            host: "10.0.0.2".into(),
            cores: Some(4),
            memory: Some("8g".into()),
            instances: Some(2),
            ssh_user: None,
        }]);
        assert!(config.worker_for_host("10.0.0.2").is_some());
        assert!(config.worker_for_host("10.0.0.3").is_none());
        assert!(config.is_driver("10.0.0.1"));
    }
}
