use std::path::PathBuf;

use clap::{value_parser, ArgAction, Args, Parser, Subcommand};
use pvr_domain::PixelFormat;

pub const PVR_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const PVR_BEFORE_HELP: &str = concat!(
    "pvr ",
    env!("CARGO_PKG_VERSION"),
    " - out-of-process runner for inspection algorithm packages\n\n",
    "\x1b[1;36mPackages\x1b[0m\n",
    "  package validate   Check an archive without installing it.\n",
    "  package install    Deploy an archive and build its offline environment.\n",
    "  package uninstall  Remove an installed package.\n",
    "  package list       Show installed packages and their active pids.\n",
    "  package scan       List archives waiting in the drop directory.\n",
    "  package rebuild    Recreate registry.json from install receipts.\n\n",
    "\x1b[1;36mActivation\x1b[0m\n",
    "  activate           Route a pid to an installed package.\n",
    "  deactivate         Drop a pid's route.\n\n",
    "\x1b[1;36mSmoke test\x1b[0m\n",
    "  run                Run one inspection step against raw image files.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = PVR_BEFORE_HELP,
    help_template = PVR_HELP_TEMPLATE
)]
#[allow(clippy::struct_excessive_bools)]
pub struct PvrCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        long,
        value_name = "DIR",
        help = "Runner root directory (overrides PVR_ROOT)",
        global = true
    )]
    pub root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(subcommand, about = "Validate, install, remove and list algorithm packages.")]
    Package(PackageCommand),
    #[command(
        about = "Route a pid to an installed package that supports it.",
        override_usage = "pvr activate <PID> <NAME> <VERSION>"
    )]
    Activate(ActivateArgs),
    #[command(
        about = "Drop the package route for a pid.",
        override_usage = "pvr deactivate <PID>"
    )]
    Deactivate(DeactivateArgs),
    #[command(
        about = "Run one inspection step with the package active for a pid.",
        override_usage = "pvr run --pid <PID> --image <FILE> --guide <FILE> --width <W> --height <H>"
    )]
    Run(RunArgs),
}

#[derive(Subcommand, Debug)]
pub enum PackageCommand {
    #[command(about = "Check an archive's name, manifest, requirements and wheels.")]
    Validate(ArchiveArgs),
    #[command(about = "Deploy an archive and provision its environment offline.")]
    Install(ArchiveArgs),
    #[command(about = "Remove an installed package (refused while a pid uses it).")]
    Uninstall(PackageRefArgs),
    #[command(about = "List installed packages.")]
    List,
    #[command(about = "List archives in the zips/ drop directory.")]
    Scan,
    #[command(about = "Rebuild registry.json from install receipts.")]
    Rebuild,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    #[arg(value_name = "ZIP", help = "Archive named <name>-<version>.zip")]
    pub archive: PathBuf,
}

#[derive(Args, Debug)]
pub struct PackageRefArgs {
    #[arg(value_name = "NAME")]
    pub name: String,
    #[arg(value_name = "VERSION")]
    pub version: String,
}

#[derive(Args, Debug)]
pub struct ActivateArgs {
    #[arg(value_name = "PID")]
    pub pid: String,
    #[arg(value_name = "NAME")]
    pub name: String,
    #[arg(value_name = "VERSION")]
    pub version: String,
}

#[derive(Args, Debug)]
pub struct DeactivateArgs {
    #[arg(value_name = "PID")]
    pub pid: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, value_name = "PID")]
    pub pid: String,
    #[arg(long, value_name = "INDEX", default_value_t = 0)]
    pub step: u32,
    #[arg(long = "desc", value_name = "TEXT", default_value = "")]
    pub desc: String,
    #[arg(long, value_name = "JSON", help = "Guide metadata as a JSON object")]
    pub guide_info: Option<String>,
    #[arg(long, value_name = "FILE", help = "Current camera image (raw bytes)")]
    pub image: PathBuf,
    #[arg(long, value_name = "FILE", help = "Guide image (raw bytes)")]
    pub guide: PathBuf,
    #[arg(long, value_parser = value_parser!(u32).range(1..))]
    pub width: u32,
    #[arg(long, value_parser = value_parser!(u32).range(1..))]
    pub height: u32,
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "gray8",
        value_parser = parse_format,
        help = "gray8, rgb8, bgr8 or encoded"
    )]
    pub format: PixelFormat,
    #[arg(long, value_name = "MS", help = "Override PVR_EXECUTE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,
}

fn parse_format(raw: &str) -> Result<PixelFormat, String> {
    raw.parse::<PixelFormat>().map_err(|err| err.to_string())
}
