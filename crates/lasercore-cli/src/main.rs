//! `lasercore` – operator console for the LaserCore treatment device.
//!
//! 1. Loads `~/.lasercore/config.toml`, writing defaults on first run.
//! 2. Assembles the [`LaserSystem`] and connects the controllers.
//! 3. Drops the operator into a slash-command REPL.
//! 4. Turns **Ctrl-C** into an emergency stop before exiting.

mod config;
mod repl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use lasercore_runtime::LaserSystem;
use lasercore_types::OperatorCommand;
use tracing::warn;

fn main() {
    // LASERCORE_LOG_FORMAT=json switches to JSON lines; OTEL_EXPORTER_OTLP_ENDPOINT
    // adds span export. Operator output stays on println!.
    let _telemetry = lasercore_runtime::init_tracing("lasercore");

    print_banner();

    let (startup, origin) = match config::load_startup() {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("{}: {}", "Config error".red().bold(), e);
            std::process::exit(2);
        }
    };
    let path = config::config_path();
    match origin {
        config::Origin::Created => println!(
            "  No configuration found; defaults written to {}",
            path.display().to_string().bold()
        ),
        config::Origin::Loaded => println!(
            "  Config loaded from {}",
            path.display().to_string().bold()
        ),
    }
    if startup.simulate {
        println!("  {}", "Simulation mode: no hardware is driven.".yellow());
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Runtime error".red().bold(), e);
            std::process::exit(1);
        }
    };
    let _entered = runtime.enter();

    let system = match LaserSystem::build(startup) {
        Ok(system) => system,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(1);
        }
    };

    print!("\n  Connecting controllers … ");
    match runtime.block_on(system.connect_all()) {
        Ok(()) => println!("{}", "online".green()),
        Err(e) => {
            println!("{}", "incomplete".yellow());
            println!("  {} {e}", "✗".red());
            println!(
                "  Use {} once the hardware is available.",
                "/connect".bold()
            );
        }
    }

    // ── Ctrl-C ────────────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let monitor = Arc::clone(system.monitor());
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop".yellow().bold());
        match monitor.command(OperatorCommand::EmergencyStop) {
            Ok(_) => println!("{}", "  ✓ Laser output removed.".green()),
            Err(e) => println!("  {} {e}", "✗".red()),
        }
        println!("{}", "  ✓ Exiting LaserCore.".green());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not trigger an emergency stop");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::Repl::new(&system, &runtime, shutdown).run();

    runtime.block_on(system.shutdown());
}

fn print_banner() {
    let art = r"
   _                          ____
  | |    __ _ ___  ___ _ __  / ___|___  _ __ ___
  | |   / _` / __|/ _ \ '__|| |   / _ \| '__/ _ \
  | |__| (_| \__ \  __/ |   | |__| (_) | | |  __/
  |_____\__,_|___/\___|_|    \____\___/|_|  \___|
";
    println!("{}", art.bold().cyan());
    println!(
        "  {} {}",
        "treatment console".dimmed(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}
