//! Command-line interface definitions for the `blockprep` binary.
//!
//! The parser lives here so the build script can render the manual page from
//! the same definitions.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `blockprep` binary.
#[derive(Debug, Parser)]
#[command(
    name = "blockprep",
    version,
    about = "Create, partition and format block-storage volumes using a disposable helper instance",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level. `BLOCKPREP_LOG` overrides the filter entirely.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `blockprep`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a volume, then partition and format it on a helper instance.
    #[command(name = "create")]
    Create(CreateCommand),
    /// Terminate every helper instance and delete the helper security group.
    #[command(name = "stop")]
    Stop,
}

/// Arguments for `blockprep create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Volume size in gigabytes.
    #[arg(long, value_name = "GB")]
    pub(crate) size: String,
    /// Availability zone for the volume and helper. Defaults to
    /// `default_zone` from configuration.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Device path to attach at, in `/dev/sdX` form.
    #[arg(long, value_name = "DEVICE")]
    pub(crate) device: Option<String>,
    /// Image used to boot a new helper. Defaults to `default_image_id`.
    #[arg(long, value_name = "IMAGE_ID")]
    pub(crate) image: Option<String>,
    /// Instance type for a new helper.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Keypair to install on a new helper. Must be listed under `[keys]` in
    /// `blockprep.toml`.
    #[arg(long, value_name = "NAME")]
    pub(crate) keypair: Option<String>,
    /// Detach the volume and remove every helper once formatting succeeds.
    #[arg(long)]
    pub(crate) shutdown: bool,
    /// Record the new volume id under this alias in `blockprep.toml`.
    #[arg(long, value_name = "ALIAS")]
    pub(crate) record_as: Option<String>,
    /// Overwrite an alias that is already recorded.
    #[arg(long, requires = "record_as")]
    pub(crate) force: bool,
    /// Print the outcome as JSON instead of the bare volume id.
    #[arg(long)]
    pub(crate) json: bool,
    /// Check the parameters against the provider and configuration, then
    /// exit without creating anything.
    #[arg(long)]
    pub(crate) dry_run: bool,
}
