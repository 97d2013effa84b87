//! The unit-of-work abstraction and the configuration-writer task family.
//!
//! Each task is a named, idempotent, side-effecting operation driven entirely
//! by the `ClusterConfig` (plus, for host-scoped tasks, the target host).
//! Builders own an ordered list of boxed tasks and run them strictly in
//! order; ordering between "create" tasks (truncate) and "append" tasks is
//! significant and preserved by `build::resolve_tasks`.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use log::info;

use crate::config::{ClusterConfig, DeployMode, WorkerSpec};
use crate::error::ProvisionError;
use crate::install::Fetcher;

/// Everything a task may touch: the immutable configuration plus the
/// download collaborator. No ambient state.
pub struct BuildContext<'a> {
    pub config: &'a ClusterConfig,
    pub fetcher: &'a dyn Fetcher,
}

pub trait Task: std::fmt::Debug {
    fn name(&self) -> String;
    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error>;
}

fn create_file(path: &str) -> Result<fs::File, failure::Error> {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::filesystem(parent.display().to_string(), e))?;
    }
    fs::File::create(path).map_err(|e| ProvisionError::filesystem(path, e))
}

fn append_file(path: &str) -> Result<fs::File, failure::Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProvisionError::filesystem(path, e))
}

fn write_line(file: &mut fs::File, path: &str, line: &str) -> Result<(), failure::Error> {
    writeln!(file, "{}", line).map_err(|e| ProvisionError::filesystem(path, e))
}

/// Writes the shell environment script with this host's bind address and the
/// coordinator address. Truncates; worker exports are appended afterwards by
/// `WriteWorkerEnv`.
#[derive(Debug)]
pub struct WriteEnvScript {
    pub host: String,
}

impl Task for WriteEnvScript {
    fn name(&self) -> String {
        format!("write-env-script ({})", self.host)
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let path = ctx.config.env_script_path()?;
        info!("writing environment script at {}", path);

        let mut file = create_file(&path)?;
        write_line(&mut file, &path, &format!("export SPARK_LOCAL_IP={}", self.host))?;
        write_line(
            &mut file,
            &path,
            &format!("export SPARK_MASTER_HOST={}", ctx.config.driver.host),
        )?;

        Ok(())
    }
}

/// Appends worker resource exports to the environment script written earlier
/// in the same pipeline.
#[derive(Debug)]
pub struct WriteWorkerEnv {
    pub worker: WorkerSpec,
}

impl Task for WriteWorkerEnv {
    fn name(&self) -> String {
        format!("write-worker-env ({})", self.worker.host)
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let path = ctx.config.env_script_path()?;
        info!("appending worker exports for {} to {}", self.worker.host, path);

        let mut file = append_file(&path)?;
        if let Some(cores) = self.worker.cores {
            write_line(&mut file, &path, &format!("export SPARK_WORKER_CORES={}", cores))?;
        }
        if let Some(memory) = &self.worker.memory {
            write_line(&mut file, &path, &format!("export SPARK_WORKER_MEMORY={}", memory))?;
        }
        if let Some(instances) = self.worker.instances {
            write_line(
                &mut file,
                &path,
                &format!("export SPARK_WORKER_INSTANCES={}", instances),
            )?;
        }

        Ok(())
    }
}

/// Writes the runtime defaults file for the coordinator and, in cluster
/// mode, the peer worker-hosts list.
#[derive(Debug)]
pub struct WriteCoordinatorConfig;

impl Task for WriteCoordinatorConfig {
    fn name(&self) -> String {
        "write-coordinator-config".into()
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let config = ctx.config;
        let path = config.defaults_path()?;
        info!("writing coordinator defaults at {}", path);

        let mut file = create_file(&path)?;
        write_line(
            &mut file,
            &path,
            &format!("spark.master spark://{}:7077", config.driver.host),
        )?;

        if let Some(cores) = config.driver.cores {
            write_line(&mut file, &path, &format!("spark.driver.cores {}", cores))?;
        }
        if let Some(memory) = &config.driver.memory {
            write_line(&mut file, &path, &format!("spark.driver.memory {}", memory))?;
        }
        if let Some(memory) = &config.executor_memory {
            write_line(&mut file, &path, &format!("spark.executor.memory {}", memory))?;
        }
        if let Some(derby) = &config.derby_path {
            write_line(
                &mut file,
                &path,
                &format!("spark.driver.extraJavaOptions -Dderby.system.home={}", derby),
            )?;
        }
        if let Some(warehouse) = &config.warehouse_path {
            write_line(&mut file, &path, &format!("spark.sql.warehouse.dir {}", warehouse))?;
        }

        if let Some(metastore) = &config.metastore {
            write_line(&mut file, &path, "spark.sql.catalogImplementation hive")?;
            write_line(
                &mut file,
                &path,
                &format!(
                    "spark.hadoop.javax.jdo.option.ConnectionURL {}",
                    metastore.connection_url()?
                ),
            )?;
            write_line(
                &mut file,
                &path,
                &format!(
                    "spark.hadoop.javax.jdo.option.ConnectionDriverName {}",
                    metastore.driver_class()?
                ),
            )?;
            write_line(
                &mut file,
                &path,
                &format!(
                    "spark.hadoop.javax.jdo.option.ConnectionUserName {}",
                    metastore.db_user
                ),
            )?;
            write_line(
                &mut file,
                &path,
                &format!(
                    "spark.hadoop.javax.jdo.option.ConnectionPassword {}",
                    metastore.db_pass
                ),
            )?;
        }

        if config.mode == DeployMode::Cluster {
            let workers_path = config.workers_file_path()?;
            info!("writing worker hosts list at {}", workers_path);
            let mut workers_file = create_file(&workers_path)?;
            if let Some(workers) = &config.workers {
                for worker in workers {
                    write_line(&mut workers_file, &workers_path, &worker.host)?;
                }
            }
        }

        Ok(())
    }
}

/// Renders the metastore connection descriptor. Fails before writing if the
/// referenced connector is not registered in `jdbc_drivers`.
#[derive(Debug)]
pub struct WriteMetastoreDescriptor;

impl WriteMetastoreDescriptor {
    fn render(config: &ClusterConfig) -> Result<String, failure::Error> {
        let metastore = config.metastore.as_ref().ok_or_else(|| {
            ProvisionError::config("metastore descriptor task requires a metastore section")
        })?;

        let registered = config
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

        let mut properties = vec![
            ("javax.jdo.option.ConnectionURL", metastore.connection_url()?),
            (
                "javax.jdo.option.ConnectionDriverName",
                metastore.driver_class()?.to_owned(),
            ),
            ("javax.jdo.option.ConnectionUserName", metastore.db_user.clone()),
            ("javax.jdo.option.ConnectionPassword", metastore.db_pass.clone()),
        ];
        if let Some(warehouse) = &config.warehouse_path {
            properties.push(("hive.metastore.warehouse.dir", warehouse.clone()));
        }
        properties.push(("hive.metastore.db.type", metastore.connector_artifact.clone()));

        let mut xml = String::from("<configuration>\n");
        for (name, value) in properties {
            xml.push_str(&format!(
                "  <property>\n    <name>{}</name>\n    <value>{}</value>\n  </property>\n",
                name, value
            ));
        }
        xml.push_str("</configuration>\n");

        Ok(xml)
    }
}

impl Task for WriteMetastoreDescriptor {
    fn name(&self) -> String {
        "write-metastore-descriptor".into()
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let xml = Self::render(ctx.config)?;
        let path = ctx.config.metastore_descriptor_path()?;
        info!("writing metastore descriptor at {}", path);

        let mut file = create_file(&path)?;
        file.write_all(xml.as_bytes())
            .map_err(|e| ProvisionError::filesystem(&path, e))?;

        Ok(())
    }
}

/// Appends the comma-joined maven coordinates of every configured runtime
/// jar (JDBC drivers plus the Delta jar when pinned) to the defaults file.
/// The runtime keeps only one `spark.jars.packages` value per file, so this
/// is the sole task that writes that key.
#[derive(Debug)]
pub struct WriteExtraJars;

impl Task for WriteExtraJars {
    fn name(&self) -> String {
        "write-extra-jars".into()
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let config = ctx.config;
        let mut coordinates: Vec<String> = config
            .jdbc_drivers
            .iter()
            .flat_map(|drivers| drivers.values())
            .map(|artifact| artifact.coordinate())
            .collect();
        if config.has_package("delta") {
            coordinates.push(format!(
                "io.delta:delta-spark_2.12:{}",
                config.package_version("delta")?
            ));
        }
        if coordinates.is_empty() {
            return Ok(());
        }

        let path = config.defaults_path()?;
        info!("adding {} runtime jar coordinate(s) to {}", coordinates.len(), path);

        let mut file = append_file(&path)?;
        write_line(
            &mut file,
            &path,
            &format!("spark.jars.packages {}", coordinates.join(",")),
        )
    }
}

/// Appends the Delta Lake session extension and catalog settings to the
/// defaults file when a `delta` package is pinned. The Delta jar coordinate
/// itself rides on `WriteExtraJars`.
#[derive(Debug)]
pub struct WriteDeltaConfig;

impl Task for WriteDeltaConfig {
    fn name(&self) -> String {
        "write-delta-config".into()
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        // A missing delta pin is a config error here too.
        ctx.config.package_version("delta")?;
        let path = ctx.config.defaults_path()?;
        info!("adding Delta Lake settings to {}", path);

        let mut file = append_file(&path)?;
        write_line(
            &mut file,
            &path,
            "spark.sql.extensions io.delta.sql.DeltaSparkSessionExtension",
        )?;
        write_line(
            &mut file,
            &path,
            "spark.sql.catalog.spark_catalog org.apache.spark.sql.delta.catalog.DeltaCatalog",
        )
    }
}

/// Writes the activation script: one export per installed package home, the
/// config directory, the environment name, and a single PATH augmentation
/// line. Written last so its presence marks a completed build.
#[derive(Debug)]
pub struct WriteActivationScript;

impl Task for WriteActivationScript {
    fn name(&self) -> String {
        "write-activation-script".into()
    }

    fn run(&self, ctx: &BuildContext<'_>) -> Result<(), failure::Error> {
        let config = ctx.config;
        let path = config.activation_script_path();
        info!("writing activation script at {}", path);

        let mut file = create_file(&path)?;
        let mut path_additions = Vec::new();

        for pkg in config.archive_packages() {
            let var = crate::packages::home_var(&pkg.name)?;
            let home = config.install_dir(&pkg.name)?;
            write_line(&mut file, &path, &format!("export {}=\"{}\"", var, home))?;
            path_additions.push(format!("${}/bin", var));
        }

        write_line(
            &mut file,
            &path,
            &format!("export SPARK_CONF_DIR=\"{}\"", config.spark_conf_dir()?),
        )?;
        write_line(
            &mut file,
            &path,
            &format!("export SPARKSTRAP_ENV=\"{}\"", config.name),
        )?;
        write_line(
            &mut file,
            &path,
            &format!("export PATH=$PATH:{}", path_additions.join(":")),
        )?;

        Ok(())
    }
}
