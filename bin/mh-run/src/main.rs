//! ---
//! mh_section: "07-command-line"
//! mh_subsection: "binary"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Operator CLI over the multihost orchestration core."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mh_common::logging::{init_tracing, LogFormat, LoggingConfig};
use mh_runner::{RoleRequest, RunContext};
use mh_topology::{Role, Topology};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Multihost topology control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        long = "mh-config",
        value_name = "FILE",
        env = "MH_CONFIG",
        default_value = "configs/mhc.yaml",
        help = "Path to the topology description"
    )]
    config: PathBuf,

    #[arg(
        long = "exclude-role",
        value_name = "ROLE",
        help = "Drop every host holding ROLE before doing anything (repeatable)"
    )]
    exclude_roles: Vec<Role>,

    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "pretty",
        help = "Console log format (pretty, json)"
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Parse and validate the topology, printing a per-domain summary")]
    Validate,
    #[command(about = "Connect to every host and probe command execution")]
    Check {
        #[arg(
            long,
            value_name = "SECONDS",
            default_value_t = 30,
            help = "Per-host probe budget"
        )]
        timeout: u64,
    },
    #[command(about = "Run one command on every host holding a role")]
    Exec {
        #[arg(long, value_name = "ROLE", help = "Role the command targets")]
        role: Role,
        #[arg(long, help = "Succeed quietly when no host holds the role")]
        optional: bool,
        #[arg(
            long,
            value_name = "SECONDS",
            default_value_t = 300,
            help = "Per-host command budget"
        )]
        timeout: u64,
        #[arg(
            trailing_var_arg = true,
            required = true,
            value_name = "COMMAND",
            help = "Command line to run remotely"
        )]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        format: cli.log_format,
        ..LoggingConfig::default()
    };
    init_tracing("mh-run", &logging)?;

    let mut topology = Topology::load(&cli.config)
        .with_context(|| format!("failed to load topology from {}", cli.config.display()))?;
    for role in &cli.exclude_roles {
        topology = topology.exclude_role(*role)?;
    }
    info!(
        topology_path = %cli.config.display(),
        hosts = topology.host_count(),
        "topology loaded"
    );

    match cli.command {
        Commands::Validate => validate(&topology),
        Commands::Check { timeout } => check(&topology, Duration::from_secs(timeout)).await?,
        Commands::Exec {
            role,
            optional,
            timeout,
            command,
        } => exec(&topology, role, optional, Duration::from_secs(timeout), &command).await?,
    }
    Ok(())
}

fn validate(topology: &Topology) {
    for domain in topology.domains() {
        println!("domain {} ({} hosts)", domain.id, domain.hosts.len());
        for host in domain.hosts.values() {
            println!("  {:<8} {:<32} {}", host.role.to_string(), host.hostname, host.id);
        }
    }
    println!("topology OK: {} hosts", topology.host_count());
}

/// Provisioning check: every host in the topology must accept a connection
/// and run a trivial command. Any failure is fatal; a half-provisioned
/// environment must be fixed before a suite is pointed at it.
async fn check(topology: &Topology, budget: Duration) -> Result<()> {
    let run = RunContext::with_defaults(topology);
    for host in topology.hosts() {
        let mut lease = run.pool().acquire(&host.id).await?;
        let session = lease
            .session()
            .await
            .with_context(|| format!("cannot reach {}", host.id))?;
        let output = session.execute("echo mh-probe", budget).await?;
        if !output.success() {
            bail!(
                "probe command exited {} on {}: {}",
                output.exit_code,
                host.id,
                output.stderr.trim()
            );
        }
        info!(host = %host.id, "probe succeeded");
    }
    run.shutdown().await;
    println!("all {} hosts reachable", topology.host_count());
    Ok(())
}

async fn exec(
    topology: &Topology,
    role: Role,
    optional: bool,
    budget: Duration,
    command: &[String],
) -> Result<()> {
    let run = RunContext::with_defaults(topology);
    let request = if optional {
        RoleRequest::optional(role)
    } else {
        RoleRequest::required(role)
    };
    let mut ctx = run.test_context(&[request]).await?;

    let hosts = ctx.hosts_for_role(role).to_vec();
    if hosts.is_empty() {
        warn!(%role, "no host holds the role; nothing to do");
    }

    let command = command.join(" ");
    let mut failed = false;
    for host in &hosts {
        let output = ctx.execute(host, &command, budget).await?;
        println!("--- {} (exit {})", host, output.exit_code);
        if !output.stdout.is_empty() {
            print!("{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
        failed |= !output.success();
    }

    let teardown = ctx.teardown().await;
    if !teardown.quarantined.is_empty() {
        warn!(hosts = ?teardown.quarantined, "hosts quarantined during teardown");
    }
    let report = run.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failed {
        bail!("command failed on at least one host");
    }
    Ok(())
}
