//! hostnetd - host network provisioning agent
//!
//! Entry point for the hostnetd command line. Each subcommand runs one
//! lifecycle verb and exits 0 on success, 1 on failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devmgr::{FlowSpec, MirrorStatus};
use dhcpmgr::HostBinding;
use fwmgr::{Direction, Verdict};
use hostnet_common::config::DEFAULT_CONFIG_PATH;
use hostnet_common::{AddressBlock, AgentConfig, HostnetError, ShellRunner};
use hostnetd::logging::init_logging;
use hostnetd::{DhcpProvision, L3Provision, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Host network provisioning agent
#[derive(Parser, Debug)]
#[command(name = "hostnetd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Attach a workload port to the integration bridge
    AttachPort {
        port: String,
        vlan: u16,
        /// Route the port through a Linux bridge with security-group chains
        #[arg(long)]
        security_group: bool,
    },
    /// Detach a workload port
    DetachPort {
        port: String,
        #[arg(long)]
        security_group: bool,
    },
    /// Start or update the DHCP service of a network
    DhcpProvision {
        network: String,
        /// Address block, a.b.c.d/n
        block: AddressBlock,
        vlan: u16,
        /// Host binding, mac,ip
        #[arg(long)]
        host: Option<HostBinding>,
        #[arg(long)]
        namespace: Option<String>,
        /// Allow starting the service
        #[arg(long)]
        first: bool,
    },
    /// Register a host binding, mac,ip, with a running DHCP service
    DhcpHostAdd { network: String, host: HostBinding },
    /// Drop the binding of a MAC address from a running DHCP service
    DhcpHostDel { network: String, mac: String },
    /// Stop the DHCP service of a network and remove its namespace
    DhcpTeardown {
        network: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Create an L3 routing domain between a workload and an upstream network
    L3Provision {
        router: String,
        network: String,
        workload: AddressBlock,
        workload_vlan: u16,
        upstream: AddressBlock,
        upstream_vlan: u16,
    },
    /// Remove an L3 routing domain
    L3Teardown {
        router: String,
        network: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Add or replace an on-link route in a routing domain
    RouteAdd {
        router: String,
        cidr: String,
        dev: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Delete an on-link route from a routing domain
    RouteDel {
        router: String,
        cidr: String,
        dev: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// List on-link routes of a device in a routing domain
    RouteList {
        router: String,
        dev: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Mirror the mirror bridge's traffic to a VLAN
    MirrorEnable {
        /// Defaults to the configured mirror VLAN
        #[arg(long)]
        vlan: Option<u16>,
    },
    MirrorDisable,
    MirrorStatus,
    /// Install a user login flow, given as key=value tokens
    FlowAdd {
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Remove a user login flow
    FlowDel {
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Add a rule to a port's security-group chain
    SgRuleAdd {
        port: String,
        /// ingress or egress
        direction: Direction,
        #[arg(allow_hyphen_values = true)]
        expr: String,
    },
    SgRuleDel {
        port: String,
        direction: Direction,
        #[arg(allow_hyphen_values = true)]
        expr: String,
    },
    /// Print the rules of a port's security-group chain
    SgRuleList { port: String, direction: Direction },
    /// Match a port's address set in its chain and optionally fill the set
    SgIpsetRule {
        port: String,
        direction: Direction,
        /// accept, drop or reject
        verdict: Verdict,
        members: Vec<String>,
    },
    IpsetAdd {
        port: String,
        #[arg(required = true)]
        members: Vec<String>,
    },
    IpsetDel {
        port: String,
        #[arg(required = true)]
        members: Vec<String>,
    },
    /// Empty a port's address set
    IpsetFlush { port: String },
    /// Wrap the built-in chains and create the dispatch chain
    FirewallInit,
}

async fn run(orch: &Orchestrator, verb: Verb) -> Result<()> {
    match verb {
        Verb::AttachPort { port, vlan, security_group } => {
            orch.attach_port(&port, vlan, security_group).await?
        }
        Verb::DetachPort { port, security_group } => orch.detach_port(&port, security_group).await?,
        Verb::DhcpProvision { network, block, vlan, host, namespace, first } => {
            let req = DhcpProvision { network, block, vlan, host, namespace, first };
            let pid = orch.provision_dhcp(&req).await?;
            println!("{}", pid);
        }
        Verb::DhcpHostAdd { network, host } => orch.add_dhcp_host(&network, &host).await?,
        Verb::DhcpHostDel { network, mac } => {
            if !orch.remove_dhcp_host(&network, &mac).await? {
                info!("No binding for {} in network {}", mac, network);
            }
        }
        Verb::DhcpTeardown { network, namespace } => {
            orch.teardown_dhcp(&network, namespace.as_deref()).await?
        }
        Verb::L3Provision { router, network, workload, workload_vlan, upstream, upstream_vlan } => {
            let req = L3Provision { router, network, workload, workload_vlan, upstream, upstream_vlan };
            orch.provision_l3(&req).await?
        }
        Verb::L3Teardown { router, network, namespace } => {
            orch.teardown_l3(&router, &network, namespace.as_deref()).await?
        }
        Verb::RouteAdd { router, cidr, dev, namespace } => {
            orch.add_route(&router, &cidr, &dev, namespace.as_deref()).await?
        }
        Verb::RouteDel { router, cidr, dev, namespace } => {
            orch.delete_route(&router, &cidr, &dev, namespace.as_deref()).await?
        }
        Verb::RouteList { router, dev, namespace } => {
            for route in orch.list_routes(&router, &dev, namespace.as_deref()).await? {
                println!("{}", route);
            }
        }
        Verb::MirrorEnable { vlan } => orch.enable_mirror(vlan).await?,
        Verb::MirrorDisable => orch.disable_mirror().await?,
        Verb::MirrorStatus => match orch.mirror_status().await? {
            MirrorStatus::Disabled => println!("disabled"),
            MirrorStatus::Enabled(ids) => println!("enabled {}", ids.join(" ")),
        },
        Verb::FlowAdd { tokens } => orch.user_login(&FlowSpec::from_tokens(&tokens)?).await?,
        Verb::FlowDel { tokens } => orch.user_logout(&FlowSpec::from_tokens(&tokens)?).await?,
        Verb::SgRuleAdd { port, direction, expr } => {
            let report = orch.add_sg_rule(&port, direction, &expr).await?;
            if report.is_noop() {
                info!("Rule already present, nothing changed");
            } else {
                info!("{} rules added, {} conflicts", report.added_rules.len(), report.conflicts.len());
            }
        }
        Verb::SgRuleDel { port, direction, expr } => {
            let report = orch.remove_sg_rule(&port, direction, &expr).await?;
            if report.is_noop() {
                info!("Rule not present, nothing changed");
            } else {
                info!("{} lines removed", report.removed_lines);
            }
        }
        Verb::SgRuleList { port, direction } => {
            for rule in orch.list_sg_rules(&port, direction).await? {
                println!("{}", rule);
            }
        }
        Verb::SgIpsetRule { port, direction, verdict, members } => {
            orch.init_ipset_rule(&port, verdict, direction, &members).await?;
        }
        Verb::IpsetAdd { port, members } => orch.add_ipset_members(&port, &members).await?,
        Verb::IpsetDel { port, members } => orch.remove_ipset_members(&port, &members).await?,
        Verb::IpsetFlush { port } => orch.flush_ipset_members(&port).await?,
        Verb::FirewallInit => orch.init_firewall().await?,
    }
    Ok(())
}

async fn execute(config: AgentConfig, verb: Verb) -> Result<()> {
    let runner = Arc::new(ShellRunner::new(Some(config.command_timeout())));
    let orch = Orchestrator::new(config, runner)?;
    run(&orch, verb).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hostnetd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    // Flushes the log file when dropped at exit.
    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("hostnetd: initialising logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("hostnetd {} with config {}", env!("CARGO_PKG_VERSION"), args.config.display());

    match execute(config, args.verb).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<HostnetError>() {
                Some(err) if err.is_configuration_error() => error!("Request rejected: {:#}", e),
                Some(err) if err.is_external_tool_error() => error!("Host command failed: {:#}", e),
                _ => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
