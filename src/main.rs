// svirt-verify - Main Entry Point
//
// Command line front end for the label lifecycle verifier:
// - run: verify a single label policy against the configured VM
// - matrix: verify the full policy matrix and write reports
// - show-config: print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use svirt_verify::adapters::command::ToolRunner;
use svirt_verify::adapters::{FakeHost, LibvirtdService, SelinuxLabelStore, VirshControl, VmControl};
use svirt_verify::config::Config;
use svirt_verify::logging::LoggingConfig;
use svirt_verify::scenario::{run_matrix, MatrixTarget, PreLabel, Scenario, ScenarioMatrix};
use svirt_verify::verifier::{HostAdapters, LifecycleVerifier, ScenarioResult, Teardown, Verdict};
use svirt_verify::{EnforcementMode, SecType};

/// svirt-verify: security label lifecycle verification for libvirt guests
#[derive(Parser, Debug)]
#[command(name = "svirt-verify")]
#[command(version)]
#[command(about = "Verify SELinux label lifecycle of libvirt guests", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: ~/.config/svirt-verify/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Domain name (overrides vm.name)
    #[arg(long)]
    vm: Option<String>,

    /// Disk image to verify; repeatable (overrides vm.disks)
    #[arg(long = "disk")]
    disks: Vec<PathBuf>,

    /// Enforcement mode forced during the run
    #[arg(long)]
    host_mode: Option<EnforcementMode>,

    /// How the VM is stopped
    #[arg(long)]
    teardown: Option<Teardown>,

    /// Run against an in-memory host instead of this machine
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify one label policy
    Run {
        /// Security label type
        #[arg(long = "type", default_value = "dynamic")]
        sec_type: SecType,

        /// Let the control plane relabel disks (yes/no)
        #[arg(long, default_value = "yes", action = clap::ArgAction::Set, value_parser = parse_yes_no)]
        relabel: bool,

        /// Label forced onto the disks before boot
        #[arg(long, default_value = "matching")]
        pre_label: PreLabel,

        /// Override the expected outcome (yes/no); derived from the policy
        /// when omitted
        #[arg(long, value_parser = parse_yes_no)]
        expect_failure: Option<bool>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Verify the full label policy matrix
    Matrix {
        /// Report directory (overrides report.output_dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Ok(true),
        "no" | "n" | "false" | "0" => Ok(false),
        _ => Err(format!("expected yes or no, got {}", value)),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {:?}", path);
            }
            Config::load_from_path(path)?
        }
        None => Config::load()?,
    };

    LoggingConfig::from_config(&config.logging, args.verbose)?.init()?;

    match args.command {
        Commands::Run {
            sec_type,
            relabel,
            pre_label,
            expect_failure,
            json,
            target,
        } => {
            let scenario = Scenario::new(sec_type, relabel, pre_label);
            run_single(&config, scenario, expect_failure, json, target).await
        }
        Commands::Matrix { output_dir, target } => {
            run_full_matrix(&config, output_dir, target).await
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Adapters and target resolved from config and command line
struct Host {
    verifier: LifecycleVerifier,
    target: MatrixTarget,
}

async fn connect(config: &Config, args: TargetArgs) -> Result<Host> {
    let vm_name = args.vm.unwrap_or_else(|| config.vm.name.clone());
    let mut disks = if args.disks.is_empty() {
        config.vm.disks.iter().map(PathBuf::from).collect()
    } else {
        args.disks
    };

    let adapters = if args.simulate {
        if disks.is_empty() {
            disks.push(PathBuf::from(format!("/var/lib/libvirt/images/{}.qcow2", vm_name)));
        }
        info!("Simulating host with domain {} ({} disk(s))", vm_name, disks.len());
        let host = Arc::new(
            FakeHost::simulated(&vm_name, &disks, &config.labels.matching_image_label)
                .context("Failed to build simulated host")?,
        );
        HostAdapters::new(host.clone(), host.clone(), Some(host))
    } else {
        let runner = ToolRunner::new(config.command_timeout());
        let vm = Arc::new(VirshControl::new(runner.clone(), config.host.libvirt_uri.clone()));
        if disks.is_empty() {
            disks = vm
                .read_descriptor(&vm_name)
                .await
                .with_context(|| format!("Failed to read domain {}", vm_name))?
                .disk_sources();
        }
        HostAdapters::new(
            Arc::new(SelinuxLabelStore::new(runner.clone())),
            vm,
            Some(Arc::new(LibvirtdService::new(
                runner,
                &config.host.qemu_conf_path,
                &config.host.daemon,
            ))),
        )
    };

    if disks.is_empty() {
        bail!("Domain {} has no disk images to verify", vm_name);
    }

    Ok(Host {
        verifier: LifecycleVerifier::new(adapters, config.verifier_options()),
        target: MatrixTarget {
            vm_name,
            disks,
            host_mode: args.host_mode.unwrap_or(config.host.enforcement_mode),
            teardown: args.teardown.unwrap_or(config.vm.teardown),
        },
    })
}

/// Cancel `token` on Ctrl-C; the run in progress still restores the host
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, restoring host state before exit");
            child.cancel();
        }
    });
    token
}

async fn run_single(
    config: &Config,
    scenario: Scenario,
    expect_failure: Option<bool>,
    json: bool,
    target: TargetArgs,
) -> Result<ExitCode> {
    let host = connect(config, target).await?;
    let mut request = scenario.request(&config.labels, &host.target);
    if let Some(expect_failure) = expect_failure {
        request.expect_failure = expect_failure;
    }

    let result = host
        .verifier
        .run_with_cancel(request, cancel_on_interrupt())
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(exit_code(result.verdict() == Verdict::Pass))
}

async fn run_full_matrix(
    config: &Config,
    output_dir: Option<PathBuf>,
    target: TargetArgs,
) -> Result<ExitCode> {
    let host = connect(config, target).await?;
    let matrix = ScenarioMatrix::new(&config.labels);

    let report = run_matrix(&host.verifier, &matrix, &host.target, cancel_on_interrupt()).await;

    println!("\n{}", report.summary());
    let output_dir = output_dir.unwrap_or_else(|| PathBuf::from(&config.report.output_dir));
    report.save(&output_dir)?;

    Ok(exit_code(report.is_success()))
}

fn print_result(result: &ScenarioResult) {
    println!("Scenario: {} ({})", result.scenario, result.policy);
    for record in &result.phases {
        println!("  {:<32} {}", record.phase.to_string(), record.outcome);
    }
    for phase in &result.skipped {
        println!("  {:<32} SKIPPED", phase.to_string());
    }
    for failure in &result.restoration_failures {
        println!("  WARNING: {} not restored: {}", failure.target, failure.message);
    }
    println!("Verdict: {}", result.verdict());
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
