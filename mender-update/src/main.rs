#![deny(rust_2018_idioms)]

/*!
# Introduction

`mender-update` is the update half of the device-update agent. As a daemon
it polls the backend for deployments, downloads and verifies artifacts,
hands the payload to the matching update module, and walks the deployment
through install, reboot, commit or rollback, reporting status along the
way. The standalone subcommands (`install`/`commit`/`rollback`) drive the
same machinery for one artifact without a server.

Authentication lives in the companion auth daemon; this process asks it
for tokens over a local socket and never touches the device key.
*/

mod config;
mod context;
mod daemon;
mod db;
mod deployment_log;
mod deployments;
mod error;
mod inventory;
mod standalone;

use crate::config::MenderConfig;
use crate::context::MenderContext;
use crate::error::{Error, Result};
use log::{info, LevelFilter};
use snafu::ResultExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, process};

#[derive(Debug, PartialEq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Command {
    Daemon,
    Install,
    Commit,
    Rollback,
    CheckUpdate,
    SendInventory,
    ShowArtifact,
    ShowProvides,
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

fn usage() -> ! {
    #[rustfmt::skip]
    eprintln!("\
USAGE:
    mender-update <SUBCOMMAND> <OPTIONS>

SUBCOMMANDS:
    daemon                  Run as a daemon, polling for deployments
    install <PATH-OR-URL>   Install an artifact without a server
        [ --reboot-exit-code ]        Exit with code 4 when the module
                                      requires a reboot
    commit                  Commit an installed-but-uncommitted update
    rollback                Roll an installed-but-uncommitted update back
    check-update            Query the server once for a new deployment
    send-inventory          Gather and push inventory once
    show-artifact           Print the currently installed artifact name
    show-provides           Print the current artifact provides

GLOBAL OPTIONS:
    [ -c | --config FILE ]           Main config file
    [ -b | --fallback-config FILE ]  Fallback config file
    [ -d | --data DIR ]              Data store directory
    [ --log-level trace|debug|info|warn|error ]  Set logging verbosity");
    process::exit(1)
}

/// The parsed command line.
struct Arguments {
    command: Command,
    config_path: Option<PathBuf>,
    fallback_config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    log_level: Option<LevelFilter>,
    install_src: Option<String>,
    reboot_exit_code: bool,
}

fn parse_args(args: env::Args) -> Arguments {
    let mut command = None;
    let mut config_path = None;
    let mut fallback_config_path = None;
    let mut data_dir = None;
    let mut log_level = None;
    let mut install_src = None;
    let mut reboot_exit_code = false;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "-c" | "--config" => {
                config_path = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --config")
                })));
            }
            "-b" | "--fallback-config" => {
                fallback_config_path = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --fallback-config")
                })));
            }
            "-d" | "--data" => {
                data_dir = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --data")
                })));
            }
            "--log-level" => {
                let level = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&level).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", level))
                }));
            }
            "--reboot-exit-code" => {
                reboot_exit_code = true;
            }
            s if !s.starts_with('-') => {
                if command.is_none() {
                    command = Some(
                        serde_plain::from_str::<Command>(s).unwrap_or_else(|_| usage()),
                    );
                } else if command == Some(Command::Install) && install_src.is_none() {
                    install_src = Some(s.to_string());
                } else {
                    usage();
                }
            }
            _ => usage(),
        }
    }

    Arguments {
        command: command.unwrap_or_else(|| usage()),
        config_path,
        fallback_config_path,
        data_dir,
        log_level,
        install_src,
        reboot_exit_code,
    }
}

fn load_config(arguments: &Arguments) -> Result<MenderConfig> {
    let main = arguments
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_CONF_FILE));
    let fallback = arguments
        .fallback_config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_FALLBACK_CONF_FILE));
    let mut config = MenderConfig::load(
        &main,
        arguments.config_path.is_some(),
        &fallback,
        arguments.fallback_config_path.is_some(),
    )?;
    if let Some(dir) = &arguments.data_dir {
        config.set_data_store_dir(dir.clone());
    }
    Ok(config)
}

fn effective_log_level(arguments: &Arguments, config: &MenderConfig) -> LevelFilter {
    if let Some(level) = arguments.log_level {
        return level;
    }
    config
        .daemon_log_level
        .as_deref()
        .and_then(|l| LevelFilter::from_str(l).ok())
        .unwrap_or(LevelFilter::Info)
}

async fn run_command(arguments: Arguments, config: MenderConfig) -> Result<()> {
    let mut ctx = MenderContext::initialize(config)?;

    match arguments.command {
        Command::Daemon => daemon::run(ctx).await,
        Command::Install => {
            let src = arguments
                .install_src
                .unwrap_or_else(|| usage_msg("install requires an artifact path or URL"));
            match standalone::install(&mut ctx, &src).await? {
                standalone::InstallOutcome::RebootRequired if arguments.reboot_exit_code => {
                    Err(Error::RebootRequired)
                }
                outcome => {
                    info!("Install outcome: {:?}", outcome);
                    Ok(())
                }
            }
        }
        Command::Commit => standalone::commit(&mut ctx).await,
        Command::Rollback => standalone::rollback(&mut ctx).await,
        Command::CheckUpdate => {
            let api = deployments::ApiClient::new(&ctx.config)?;
            let device_type = ctx.device_type()?;
            let provides = ctx.load_provides()?;
            match deployments::check_new_deployments(&api, &device_type, &provides).await? {
                Some(response) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&response)
                            .context(error::StateDataEncodeSnafu)?
                    );
                    Ok(())
                }
                None => {
                    eprintln!("No update available");
                    Ok(())
                }
            }
        }
        Command::SendInventory => {
            let api = deployments::ApiClient::new(&ctx.config)?;
            let device_type = ctx.device_type()?;
            let data =
                inventory::gather(&ctx.config.inventory_generators_dir, &device_type).await?;
            inventory::push(&api, &inventory::payload(&data)).await
        }
        Command::ShowArtifact => {
            let provides = ctx.load_provides()?;
            match provides.get("artifact_name") {
                Some(name) => println!("{}", name),
                None => println!("unknown"),
            }
            Ok(())
        }
        Command::ShowProvides => {
            let provides = ctx.load_provides()?;
            let mut keys: Vec<&String> = provides.keys().collect();
            keys.sort();
            for key in keys {
                println!("{}={}", key, provides[key]);
            }
            Ok(())
        }
    }
}

fn main_inner() -> Result<()> {
    let arguments = parse_args(env::args());
    let config = load_config(&arguments)?;

    deployment_log::init(effective_log_level(&arguments, &config))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context(error::RuntimeSnafu)?;
    runtime.block_on(run_command(arguments, config))
}

fn main() -> ! {
    process::exit(match main_inner() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            error::exit_status(&err)
        }
    })
}
