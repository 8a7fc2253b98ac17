use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use pvr_core::{
    format_status_message, to_json_response, CommandGroup, CommandInfo, ExecutionOutcome,
    GlobalOptions, RunnerConfig, RunnerEngine,
};
use serde_json::Value;

mod cli;
mod dispatch;
mod style;

use cli::PvrCli;
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = PvrCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let global = GlobalOptions {
        quiet: cli.quiet,
        verbose: cli.verbose,
        trace: cli.trace,
        json: cli.json,
        root: cli.root.as_ref().map(|p| p.to_string_lossy().to_string()),
    };
    let config = RunnerConfig::for_options(&global).map_err(|err| eyre!("{err:#}"))?;
    let engine = RunnerEngine::system(config);

    let (info, outcome) = dispatch::dispatch_command(&engine, &cli.command)?;
    engine.shutdown();
    let code = emit_output(&cli, info, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else {
        match (quiet, verbose) {
            (true, 0) => "error",
            (_, 0) => "warn",
            (_, 1) => "info",
            (_, 2) => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "pvr_core={level},pvr_cli={level},pvr::algo={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &PvrCli, info: CommandInfo, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = to_json_response(info, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet {
        let message = format_status_message(info, &outcome.message);
        println!("{}", style.status(&outcome.status, &message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
        if let Some(table) = render_package_table(&style, info, &outcome.details) {
            println!("{table}");
        }
    } else if code != 0 {
        eprintln!("{}", format_status_message(info, &outcome.message));
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn render_package_table(style: &Style, info: CommandInfo, details: &Value) -> Option<String> {
    if info.group != CommandGroup::Package || info.name != "list" {
        return None;
    }
    let packages = details.get("packages")?.as_array()?;
    if packages.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for pkg in packages {
        let obj = pkg.as_object()?;
        let pids = obj
            .get("active_pids")
            .and_then(Value::as_array)
            .map(|pids| {
                pids.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        rows.push([
            obj.get("name")?.as_str()?.to_string(),
            obj.get("version")?.as_str()?.to_string(),
            obj.get("interpreter")?.as_str()?.to_string(),
            obj.get("environment_status")
                .and_then(|status| status.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            pids,
        ]);
    }

    Some(format_table(
        style,
        ["Package", "Version", "Python", "Env", "Active"],
        &rows,
    ))
}

fn format_table<const N: usize>(style: &Style, headers: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(style.table_header(&line(headers.to_vec())));
    lines.push(
        widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in rows {
        lines.push(line(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}
