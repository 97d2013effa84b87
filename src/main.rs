//! `sparkstrap` provisions simple Apache Spark clusters: it installs pinned
//! runtime packages, renders the derived configuration files, and for
//! multi-host deployments replicates the driver-side install to each worker
//! over SSH.

mod build;
mod config;
mod error;
mod install;
mod packages;
mod remote;
mod tasks;

use clap::{App, AppSettings, Arg, SubCommand};
use console::style;

use crate::build::{build_for_role, role_for_host, Role};
use crate::config::{ClusterConfig, DeployMode};
use crate::install::HttpFetcher;
use crate::remote::replicate_to_workers;
use crate::tasks::BuildContext;

fn run() -> Result<(), failure::Error> {
    let matches = App::new("sparkstrap")
        .about(
            "Provisions simple Apache Spark clusters. Installs pinned runtimes, renders \
             configuration files, and replicates the install to worker hosts over SSH.",
        )
        .setting(AppSettings::SubcommandRequired)
        .setting(AppSettings::DisableVersion)
        .subcommand(
            SubCommand::with_name("build")
                .about("Build the environment described by the given config file(s) on this host")
                .arg(
                    Arg::with_name("CONFIG")
                        .required(true)
                        .multiple(true)
                        .help("Config JSON path(s); later files override earlier top-level keys"),
                )
                .arg(
                    Arg::with_name("HOST")
                        .long("host")
                        .takes_value(true)
                        .help("Identity of this host (defaults to the driver host)"),
                )
                .arg(
                    Arg::with_name("NO_REPLICATE")
                        .long("no-replicate")
                        .help("Skip replication to worker hosts after the coordinator build"),
                ),
        )
        .subcommand(
            SubCommand::with_name("worker")
                .about("Run the cluster-worker build for the given host")
                .arg(Arg::with_name("HOST").required(true).help("This worker's host address"))
                .arg(
                    Arg::with_name("CONFIG")
                        .long("config")
                        .required(true)
                        .takes_value(true)
                        .help("Path to the replicated configuration record"),
                ),
        )
        .subcommand(
            SubCommand::with_name("template")
                .about("Write a sample configuration file")
                .arg(
                    Arg::with_name("MODE")
                        .required(true)
                        .possible_values(&["single-node", "cluster"]),
                )
                .arg(Arg::with_name("PATH").required(true).help("Where to write the template")),
        )
        .get_matches();

    match matches.subcommand() {
        ("build", Some(sub_m)) => cmd_build(sub_m),
        ("worker", Some(sub_m)) => cmd_worker(sub_m),
        ("template", Some(sub_m)) => cmd_template(sub_m),
        _ => unreachable!(),
    }
}

fn cmd_build(matches: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let config_paths: Vec<&str> = matches.values_of("CONFIG").unwrap().collect();
    let config = ClusterConfig::read_layered(&config_paths)?;

    let host = matches
        .value_of("HOST")
        .unwrap_or(&config.driver.host)
        .to_owned();
    let role = role_for_host(&config, &host);

    let fetcher = HttpFetcher::new()?;
    let ctx = BuildContext {
        config: &config,
        fetcher: &fetcher,
    };
    build_for_role(&ctx, role, &host)?;

    println!(
        "Build complete. Run `source {}` to activate the environment.",
        config.activation_script_path()
    );

    if role == Role::ClusterCoordinator && !matches.is_present("NO_REPLICATE") {
        let reports = replicate_to_workers(&config);
        let mut failed = 0;

        for report in &reports {
            match &report.outcome {
                Ok(()) => println!("{} {}", style("replicated").green().bold(), report.host),
                Err(err) => {
                    failed += 1;
                    println!("{} {}: {}", style("FAILED").red().bold(), report.host, err);
                }
            }
        }

        if failed > 0 {
            return Err(failure::format_err!(
                "replication failed on {} of {} worker host(s)",
                failed,
                reports.len()
            ));
        }
    }

    Ok(())
}

fn cmd_worker(matches: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let host = matches.value_of("HOST").unwrap();
    let config_path = matches.value_of("CONFIG").unwrap();
    let config = ClusterConfig::read_layered(&[config_path])?;

    let fetcher = HttpFetcher::new()?;
    let ctx = BuildContext {
        config: &config,
        fetcher: &fetcher,
    };
    build_for_role(&ctx, Role::ClusterWorker, host)
}

fn cmd_template(matches: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let mode = match matches.value_of("MODE").unwrap() {
        "single-node" => DeployMode::SingleNode,
        _ => DeployMode::Cluster,
    };
    let path = matches.value_of("PATH").unwrap();

    let template = ClusterConfig::template(mode);
    template.write_json(path)?;

    println!("Template written to {}", path);
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        println!("{}", style("sparkstrap encountered an error:").red().bold());

        // Errors from SSH commands carry their own context.
        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        println!("{}", err);

        std::process::exit(101);
    }
}
