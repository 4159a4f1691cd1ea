//! cmake-pilot command line
//!
//! Each invocation starts a CMake server for the project, runs one verb to
//! completion and stops the server again.

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use cmake_pilot_core::{BuildAction, BuildController, Settings, SettingsContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod events;

use events::{wait_for, Goal};

fn cli() -> Command {
    Command::new("cmake-pilot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Configure and build CMake projects through the CMake server")
        .subcommand_required(true)
        .arg(
            Arg::new("source")
                .short('C')
                .long("source")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .help("Project source directory (defaults to the current directory)"),
        )
        .arg(
            Arg::new("settings")
                .short('s')
                .long("settings")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .help("Settings file (defaults to <source>/.cmake-pilot.json)"),
        )
        .arg(
            Arg::new("variant")
                .long("variant")
                .value_name("CONFIGURATION")
                .global(true)
                .help("Build variant, e.g. Debug or Release"),
        )
        .arg(
            Arg::new("toolchain")
                .long("toolchain")
                .value_name("NAME")
                .global(true)
                .help("Toolchain from the settings file"),
        )
        .arg(
            Arg::new("accept-unknown-version")
                .long("accept-unknown-version")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Continue when the cmake version cannot be determined"),
        )
        .subcommand(
            Command::new("configure").about("Configure the project").arg(
                Arg::new("clean")
                    .long("clean")
                    .action(ArgAction::SetTrue)
                    .help("Remove CMakeCache.txt first"),
            ),
        )
        .subcommand(
            Command::new("build").about("Build the project").arg(
                Arg::new("target")
                    .short('t')
                    .long("target")
                    .value_name("TARGET")
                    .help("Target to build (defaults to all)"),
            ),
        )
        .subcommand(Command::new("clean").about("Run the clean target"))
        .subcommand(Command::new("install").about("Run the install target"))
        .subcommand(
            Command::new("nuke").about("Delete the build directory and configure from scratch"),
        )
        .subcommand(Command::new("targets").about("List buildable targets"))
        .subcommand(Command::new("configurations").about("List build variants"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_context(matches: &ArgMatches) -> Result<Arc<SettingsContext>> {
    let source = match matches.get_one::<PathBuf>("source") {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine the current directory")?,
    };
    let settings = Settings::discover(
        matches.get_one::<PathBuf>("settings").map(|p| p.as_path()),
        &source,
    )?;
    debug!("Settings: {:?}", settings);

    let ctx = SettingsContext::new(settings)
        .accept_unknown_version(matches.get_flag("accept-unknown-version"));
    if let Some(variant) = matches.get_one::<String>("variant") {
        ctx.set_variant(variant)?;
    }
    if let Some(toolchain) = matches.get_one::<String>("toolchain") {
        ctx.select_toolchain(toolchain)?;
    }
    Ok(Arc::new(ctx))
}

async fn run_verb(
    controller: &BuildController,
    ctx: &SettingsContext,
    name: &str,
    sub: &ArgMatches,
) -> Result<()> {
    let mut events = controller.subscribe();

    match name {
        "configure" => {
            controller.start().await?;
            controller.configure(sub.get_flag("clean")).await?;
            wait_for(&mut events, Goal::Configured).await?;
        }
        "build" => {
            if let Some(target) = sub.get_one::<String>("target") {
                ctx.set_target(Some(target.clone()));
            }
            controller.start().await?;
            controller.build().await?;
            wait_for(&mut events, Goal::Build(BuildAction::Build)).await?;
        }
        "clean" => {
            controller.start().await?;
            controller.clean().await?;
            wait_for(&mut events, Goal::Build(BuildAction::Clean)).await?;
        }
        "install" => {
            controller.start().await?;
            controller.install().await?;
            wait_for(&mut events, Goal::Build(BuildAction::Install)).await?;
        }
        "nuke" => {
            controller.nuke().await?;
            wait_for(&mut events, Goal::Configured).await?;
        }
        "targets" => {
            controller.start().await?;
            controller.configure(false).await?;
            wait_for(&mut events, Goal::Configured).await?;
            for target in controller.targets() {
                println!("{}", target);
            }
        }
        other => anyhow::bail!("Unknown command {}", other),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = cli().get_matches();
    let Some((name, sub)) = matches.subcommand() else {
        anyhow::bail!("No command given");
    };
    // Global options are propagated into the subcommand's matches
    let ctx = load_context(sub)?;

    if name == "configurations" {
        for configuration in &ctx.settings().configurations {
            println!("{}", configuration);
        }
        return Ok(());
    }

    let controller = BuildController::new(ctx.collaborators());
    let result = run_verb(&controller, &ctx, name, sub).await;
    controller.stop().await?;
    if result.is_ok() {
        info!("{} finished", name);
    }
    result
}
