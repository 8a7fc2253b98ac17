use color_eyre::{eyre::eyre, Result};
use pvr_core::commands::{
    self, ActivateRequest, DeactivateRequest, PackageInstallRequest, PackageUninstallRequest,
    PackageValidateRequest, RunRequest,
};
use pvr_core::{CommandGroup, CommandInfo, ExecutionOutcome, RunnerEngine};

use crate::cli::{CommandGroupCli, PackageCommand, RunArgs};

pub fn dispatch_command(
    engine: &RunnerEngine,
    group: &CommandGroupCli,
) -> Result<(CommandInfo, ExecutionOutcome)> {
    match group {
        CommandGroupCli::Package(cmd) => dispatch_package(engine, cmd),
        CommandGroupCli::Activate(args) => {
            let info = CommandInfo::new(CommandGroup::Activate, "activate");
            let request = ActivateRequest {
                pid: args.pid.clone(),
                name: args.name.clone(),
                version: args.version.clone(),
            };
            core_call(info, || commands::activate(engine, &request))
        }
        CommandGroupCli::Deactivate(args) => {
            let info = CommandInfo::new(CommandGroup::Deactivate, "deactivate");
            let request = DeactivateRequest {
                pid: args.pid.clone(),
            };
            core_call(info, || commands::deactivate(engine, &request))
        }
        CommandGroupCli::Run(args) => {
            let info = CommandInfo::new(CommandGroup::Run, "run");
            let request = run_request_from_args(args);
            core_call(info, || commands::run_step(engine, &request))
        }
    }
}

fn dispatch_package(
    engine: &RunnerEngine,
    cmd: &PackageCommand,
) -> Result<(CommandInfo, ExecutionOutcome)> {
    match cmd {
        PackageCommand::Validate(args) => {
            let info = CommandInfo::new(CommandGroup::Package, "validate");
            let request = PackageValidateRequest {
                archive: args.archive.clone(),
            };
            core_call(info, || commands::package_validate(engine, &request))
        }
        PackageCommand::Install(args) => {
            let info = CommandInfo::new(CommandGroup::Package, "install");
            let request = PackageInstallRequest {
                archive: args.archive.clone(),
            };
            core_call(info, || commands::package_install(engine, &request))
        }
        PackageCommand::Uninstall(args) => {
            let info = CommandInfo::new(CommandGroup::Package, "uninstall");
            let request = PackageUninstallRequest {
                name: args.name.clone(),
                version: args.version.clone(),
            };
            core_call(info, || commands::package_uninstall(engine, &request))
        }
        PackageCommand::List => {
            let info = CommandInfo::new(CommandGroup::Package, "list");
            core_call(info, || commands::package_list(engine))
        }
        PackageCommand::Scan => {
            let info = CommandInfo::new(CommandGroup::Package, "scan");
            core_call(info, || commands::package_scan(engine))
        }
        PackageCommand::Rebuild => {
            let info = CommandInfo::new(CommandGroup::Package, "rebuild");
            core_call(info, || commands::package_rebuild(engine))
        }
    }
}

fn core_call<F>(info: CommandInfo, action: F) -> Result<(CommandInfo, ExecutionOutcome)>
where
    F: FnOnce() -> anyhow::Result<ExecutionOutcome>,
{
    let outcome = action().map_err(|err| eyre!("{err:?}"))?;
    Ok((info, outcome))
}

fn run_request_from_args(args: &RunArgs) -> RunRequest {
    RunRequest {
        pid: args.pid.clone(),
        step_index: args.step,
        step_desc: args.desc.clone(),
        guide_info: args.guide_info.clone(),
        image: args.image.clone(),
        guide: args.guide.clone(),
        width: args.width,
        height: args.height,
        format: args.format,
        timeout_ms: args.timeout_ms,
    }
}
