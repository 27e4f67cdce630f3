//! Binary entry point for the `blockprep` CLI.

use std::io::{self, IsTerminal, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use blockprep::{
    AwsConfig, ConfigStore, Ec2Provider, Ec2ProviderError, HelperConfig, LeaseTable,
    LifecycleController, ProcessCommandRunner, ProvisionError, ProvisionFailure,
    ProvisionOutcome, ProvisionParams, ReleaseReport, RemoteShell, SilentIndicator,
    SpinnerIndicator, SshConfig, TcpProbe, WaitIndicator, init_logging,
};

mod cli;

use cli::{Cli, Command, CreateCommand};

type Controller = LifecycleController<Ec2Provider, ProcessCommandRunner, ConfigStore, TcpProbe>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Provision(#[from] Box<ProvisionFailure<Ec2ProviderError>>),
    #[error("failed to stop helpers: {0}")]
    Stop(#[from] Box<ProvisionError<Ec2ProviderError>>),
    #[error("{failed} helper cleanup step(s) failed; rerun `blockprep stop` to retry")]
    StopIncomplete { failed: usize },
    #[error("provisioning parameters are invalid")]
    Invalid,
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.verbose) {
        write_error(io::stderr(), &err);
    }

    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let aws = AwsConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    aws.validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let helper =
        HelperConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let ssh = SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;

    match command {
        Command::Create(args) => {
            let params = build_params(&aws, &args)?;
            let controller = build_controller(&aws, &helper, ssh).await?;
            if args.dry_run {
                return check_params(&controller, &params).await;
            }
            run_create(&controller, &params, args.json).await
        }
        Command::Stop => {
            let controller = build_controller(&aws, &helper, ssh).await?;
            let report = controller.stop_helpers().await.map_err(Box::new)?;
            write_release(io::stdout(), &report)
        }
    }
}

fn build_params(aws: &AwsConfig, args: &CreateCommand) -> Result<ProvisionParams, CliError> {
    let image_id = aws
        .image_id(args.image.as_deref())
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(ProvisionParams {
        size: args.size.clone(),
        zone: args
            .zone
            .clone()
            .unwrap_or_else(|| aws.default_zone.clone()),
        device: args.device.clone(),
        image_id,
        instance_type: args
            .instance_type
            .clone()
            .unwrap_or_else(|| aws.default_instance_type.clone()),
        keypair: args.keypair.clone(),
        shutdown_after: args.shutdown,
        record_as: args.record_as.clone(),
        force: args.force,
    })
}

async fn build_controller(
    aws: &AwsConfig,
    helper: &HelperConfig,
    ssh: SshConfig,
) -> Result<Controller, CliError> {
    let settings = helper
        .to_settings()
        .map_err(|err| CliError::Config(err.to_string()))?
        .with_ssh_port(ssh.ssh_port);
    let shell =
        RemoteShell::with_process_runner(ssh).map_err(|err| CliError::Config(err.to_string()))?;
    let provider = Ec2Provider::for_region(&aws.region).await;

    let indicator: Box<dyn WaitIndicator> = if io::stderr().is_terminal() {
        Box::new(SpinnerIndicator::new())
    } else {
        Box::new(SilentIndicator)
    };

    Ok(LifecycleController::new(
        provider,
        shell,
        ConfigStore::new(),
        TcpProbe::default(),
        settings,
    )
    .with_indicator(indicator)
    .with_leases(LeaseTable::new(Duration::from_secs(helper.lease_ttl_secs)))
    .with_cancellation(cancel_on_ctrl_c()))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling and rolling back");
            trigger.cancel();
        }
    });
    cancel
}

async fn check_params(controller: &Controller, params: &ProvisionParams) -> Result<(), CliError> {
    if controller.is_valid(params).await {
        info!("provisioning parameters are valid");
        Ok(())
    } else {
        Err(CliError::Invalid)
    }
}

async fn run_create(
    controller: &Controller,
    params: &ProvisionParams,
    json: bool,
) -> Result<(), CliError> {
    let outcome = controller.run(params).await.map_err(Box::new)?;
    write_outcome(io::stdout(), &outcome, json)
}

fn write_outcome(
    mut target: impl Write,
    outcome: &ProvisionOutcome,
    json: bool,
) -> Result<(), CliError> {
    let rendered = if json {
        serde_json::to_string_pretty(outcome).map_err(|err| CliError::Output(err.to_string()))?
    } else {
        outcome.volume_id.clone()
    };
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn write_release(mut target: impl Write, report: &ReleaseReport) -> Result<(), CliError> {
    for instance_id in &report.terminated {
        writeln!(target, "{instance_id}").map_err(|err| CliError::Output(err.to_string()))?;
    }
    info!(
        count = report.terminated.len(),
        group_deleted = report.group_deleted,
        "helpers stopped"
    );
    if report.is_complete() {
        Ok(())
    } else {
        Err(CliError::StopIncomplete {
            failed: report.failures.len(),
        })
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &dyn std::error::Error) {
    writeln!(target, "{err}").ok();
}
