//! canopy - multi-workspace development orchestrator

use clap::Parser;

use canopy_core::config::Config;
use canopy_core::error::{CanopyError, Result};
use canopy_core::logging::{init_logger, LogConfig};
use canopy_core::{health, runtime, Context};
use canopy_web::{serve, ServerConfig};

mod cli;

use cli::{Cli, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if !git_available() {
        return Err(CanopyError::GitNotFound);
    }

    let log_config = LogConfig {
        log_dir: Config::app_dir()?.join("logs"),
        default_filter: if cli.debug {
            "debug".to_string()
        } else {
            "info".to_string()
        },
        ..Default::default()
    };
    let _log_guard = init_logger(&log_config)?;

    match cli.command {
        Some(Commands::Doctor) => doctor(),
        Some(Commands::Serve { port }) => run_server(&cli, port),
        None => run_server(&cli, ServerConfig::default().port),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_server(cli: &Cli, port: u16) -> Result<()> {
    let config = load_config(cli)?;
    let detected = runtime::detect(config.container_runtime)?;

    let bind_address = config.default_network_interface.bind_address();
    let ctx = Context::build(config, detected)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        ctx.spawn_background_tasks();
        serve(
            ctx,
            ServerConfig::new(port).with_address(bind_address),
        )
        .await
    })
}

fn doctor() -> Result<()> {
    let checks = vec![
        health::check_git(),
        health::check_disk_space(&std::env::current_dir()?),
        health::check_registry_file(&Config::ports_file()?),
    ];
    for check in &checks {
        println!(
            "{:<14} {:<8} {}",
            check.name,
            format!("{:?}", check.status).to_lowercase(),
            check.detail
        );
    }

    match runtime::detect(None) {
        Ok(rt) => {
            let (program, elevated) = rt.cli();
            println!(
                "{:<14} {:<8} {}{}",
                "runtime",
                "ok",
                program,
                if elevated { " (elevated)" } else { "" }
            );
        }
        Err(e) => println!("{:<14} {:<8} {e}", "runtime", "error"),
    }
    Ok(())
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok()
}
