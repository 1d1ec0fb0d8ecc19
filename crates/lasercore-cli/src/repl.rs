//! Operator REPL.
//!
//! Lines are read on a helper thread so that Ctrl-C (which sets the shutdown
//! flag after issuing an emergency stop) ends the loop without waiting for
//! the next keystroke.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use colored::Colorize;
use lasercore_protocol::document;
use lasercore_runtime::{LaserSystem, RunHandle, RunReport};
use lasercore_types::{DeviceKind, InterlockField, OperatorCommand, RunOutcome, SafetyState};
use tokio::runtime::Runtime;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    /// `None` connects every device on its configured channel.
    Connect(Option<(DeviceKind, String)>),
    Disconnect(DeviceKind),
    Session { start: bool },
    Validate(PathBuf),
    Run(PathBuf),
    Pause,
    Resume,
    Stop,
    EmergencyStop,
    Reset,
    ConfirmReset(Uuid),
    Aim(bool),
    /// Simulated footpedal.
    Pedal(bool),
    Schema,
    Quit,
}

fn on_off(arg: Option<&str>, on: &str, off: &str, usage: &str) -> Result<bool, String> {
    match arg {
        Some(a) if a == on => Ok(true),
        Some(a) if a == off => Ok(false),
        _ => Err(format!("usage: {usage}")),
    }
}

fn device(arg: Option<&str>, usage: &str) -> Result<DeviceKind, String> {
    arg.ok_or_else(|| format!("usage: {usage}"))
        .and_then(DeviceKind::from_str)
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("empty command".into());
        };
        let arg = words.next();
        let path = |usage: &str| {
            arg.map(PathBuf::from)
                .ok_or_else(|| format!("usage: {usage}"))
        };
        let cmd = match head {
            "/help" => Command::Help,
            "/status" => Command::Status,
            "/connect" => match arg {
                None => Command::Connect(None),
                Some(_) => {
                    let kind = device(arg, "/connect [<device> <channel>]")?;
                    let channel = words
                        .next()
                        .ok_or("usage: /connect [<device> <channel>]")?;
                    Command::Connect(Some((kind, channel.to_string())))
                }
            },
            "/disconnect" => Command::Disconnect(device(arg, "/disconnect <device>")?),
            "/session" => Command::Session {
                start: on_off(arg, "start", "end", "/session start|end")?,
            },
            "/validate" => Command::Validate(path("/validate <file>")?),
            "/run" => Command::Run(path("/run <file>")?),
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/stop" => Command::Stop,
            "/estop" => Command::EmergencyStop,
            "/reset" => Command::Reset,
            "/confirm-reset" => {
                let token = arg.ok_or("usage: /confirm-reset <token>")?;
                Command::ConfirmReset(
                    Uuid::parse_str(token).map_err(|e| format!("bad token: {e}"))?,
                )
            }
            "/aim" => Command::Aim(on_off(arg, "on", "off", "/aim on|off")?),
            "/pedal" => Command::Pedal(on_off(arg, "down", "up", "/pedal down|up")?),
            "/schema" => Command::Schema,
            "/quit" | "/exit" => Command::Quit,
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(cmd)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loop
// ────────────────────────────────────────────────────────────────────────────

pub struct Repl<'a> {
    system: &'a LaserSystem,
    runtime: &'a Runtime,
    run: Option<RunHandle>,
    shutdown: Arc<AtomicBool>,
}

/// Forward stdin lines; the channel closes on EOF.
fn spawn_line_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt() {
    use std::io::Write;
    print!("{} ", "lasercore>".bold().cyan());
    std::io::stdout().flush().ok();
}

impl<'a> Repl<'a> {
    pub fn new(system: &'a LaserSystem, runtime: &'a Runtime, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            system,
            runtime,
            run: None,
            shutdown,
        }
    }

    pub fn run(mut self) {
        let lines = spawn_line_reader();
        prompt();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.reap_finished_run();
            let line = match lines.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => line,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            let line = line.trim();
            if !line.is_empty() {
                match line.parse::<Command>() {
                    Ok(Command::Quit) => {
                        println!("{}", "Goodbye.".green());
                        break;
                    }
                    Ok(cmd) => self.execute(cmd),
                    Err(e) => println!(
                        "{} {}. Type {} for commands.",
                        "✗".red(),
                        e,
                        "/help".bold()
                    ),
                }
            }
            prompt();
        }
        self.finish_run();
    }

    fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::Help => help(),
            Command::Status => self.status(),
            Command::Connect(target) => self.connect(target),
            Command::Disconnect(kind) => {
                let devices = Arc::clone(self.system.devices());
                self.blocking(move || {
                    devices.disconnect(kind);
                    Ok(())
                });
                println!("  {} {kind} disconnected", "✓".green());
            }
            Command::Session { start } => self.command(if start {
                OperatorCommand::StartSession
            } else {
                OperatorCommand::EndSession
            }),
            Command::Validate(path) => self.validate(&path),
            Command::Run(path) => self.start_run(&path),
            Command::Pause => self.with_run(|run| run.pause(), "paused"),
            Command::Resume => self.with_run(|run| run.resume(), "resumed"),
            Command::Stop => self.with_run(|run| run.stop(), "stop requested"),
            Command::EmergencyStop => match self.system.emergency_stop() {
                Ok(()) => println!("  {}", "EMERGENCY STOP".red().bold()),
                Err(e) => println!("  {} {e}", "✗".red()),
            },
            Command::Reset => self.reset(),
            Command::ConfirmReset(token) => {
                match self.system.monitor().confirm_emergency_reset(token) {
                    Ok(_) => println!("  {} emergency stop cleared; state {}", "✓".green(), self.system.monitor().state()),
                    Err(e) => println!("  {} {e}", "✗".red()),
                }
            }
            Command::Aim(on) => {
                let devices = Arc::clone(self.system.devices());
                if self.blocking(move || devices.laser().set_aiming_beam(on)) {
                    println!("  {} aiming beam {}", "✓".green(), if on { "on" } else { "off" });
                }
            }
            Command::Pedal(down) => match self.system.bench() {
                Some(bench) => {
                    bench.interlock.set_footpedal(down);
                    println!("  {} pedal {}", "✓".green(), if down { "down" } else { "up" });
                }
                None => println!("  {} /pedal only works in simulation", "✗".red()),
            },
            Command::Schema => println!("{}", document::json_schema()),
            Command::Quit => {}
        }
    }

    fn status(&self) {
        let snap = self.system.monitor().snapshot();
        let state = match snap.state {
            SafetyState::Armed | SafetyState::Treating => snap.state.to_string().green().bold(),
            SafetyState::Safe => snap.state.to_string().yellow().bold(),
            SafetyState::Unsafe | SafetyState::EmergencyStop => snap.state.to_string().red().bold(),
        };
        println!("{}", "Safety".bold().underline());
        println!("  state           : {state}");
        println!(
            "  laser permitted : {}",
            if snap.laser_permitted { "yes".green() } else { "no".red() }
        );
        for field in InterlockField::ALL {
            let ok = snap.interlocks.get(field);
            println!("  {:<16}: {}", field.as_str(), if ok { "✓".green() } else { "✗".red() });
        }
        if let Some(bypass) = &snap.bypass {
            println!(
                "  {} override by {} ({})",
                "⚠".yellow().bold(),
                bypass.operator(),
                bypass.reason()
            );
        }
        if let Some(token) = self.system.monitor().pending_reset() {
            println!("  reset token     : {token}");
        }

        println!("{}", "Devices".bold().underline());
        for (kind, connected) in self.system.devices().status() {
            println!(
                "  {:<16}: {}",
                kind.as_str(),
                if connected { "connected".green() } else { "offline".dimmed() }
            );
        }

        if let Some(run) = &self.run {
            let ctx = run.context();
            println!("{}", "Run".bold().underline());
            println!("  id              : {}", ctx.run_id);
            println!("  state           : {:?}", ctx.state);
            println!(
                "  line            : {}/{} (loop {}/{})",
                ctx.line_index + 1,
                ctx.line_count,
                ctx.loop_iteration + 1,
                ctx.loop_count
            );
            println!("  elapsed         : {:.1} s", ctx.elapsed.as_secs_f64());
        }
    }

    fn connect(&self, target: Option<(DeviceKind, String)>) {
        match target {
            None => match self.runtime.block_on(self.system.connect_all()) {
                Ok(()) => println!("  {} all devices connected", "✓".green()),
                Err(e) => println!("  {} {e}", "✗".red()),
            },
            Some((kind, channel)) => {
                let devices = Arc::clone(self.system.devices());
                let shown = channel.clone();
                if self.blocking(move || devices.connect(kind, &channel)) {
                    println!("  {} {kind} on {shown}", "✓".green());
                }
            }
        }
    }

    fn command(&self, command: OperatorCommand) {
        match self.system.monitor().command(command) {
            Ok(Some(t)) => println!("  {} {} → {}", "✓".green(), t.from, t.to),
            Ok(None) => println!("  {} {}", "✓".green(), self.system.monitor().state()),
            Err(e) => println!("  {} {e}", "✗".red()),
        }
    }

    fn reset(&self) {
        let monitor = self.system.monitor();
        if monitor.state() == SafetyState::EmergencyStop {
            match monitor.request_emergency_reset() {
                Ok(token) => println!(
                    "  Confirm with {}",
                    format!("/confirm-reset {token}").bold()
                ),
                Err(e) => println!("  {} {e}", "✗".red()),
            }
        } else {
            self.command(OperatorCommand::Reset);
        }
    }

    fn validate(&self, path: &Path) {
        let validator = self.system.engine().gate().validator();
        match document::load(path, validator).and_then(|p| Ok(validator.approve(p)?)) {
            Ok(validated) => println!(
                "  {} '{}' is valid: {} line(s) × {} loop(s), about {:.1} s",
                "✓".green(),
                validated.name(),
                validated.lines.len(),
                validated.loop_count,
                validated.estimated_duration().as_secs_f64()
            ),
            Err(e) => println!("  {} {e}", "✗".red()),
        }
    }

    fn start_run(&mut self, path: &Path) {
        if self.run.is_some() {
            println!("  {} a run is already active", "✗".red());
            return;
        }
        let validator = self.system.engine().gate().validator();
        let protocol = match document::load(path, validator) {
            Ok(p) => p,
            Err(e) => {
                println!("  {} {e}", "✗".red());
                return;
            }
        };
        match self.system.engine().start(protocol) {
            Ok(handle) => {
                println!("  {} run {} started", "▶".green(), handle.run_id());
                self.run = Some(handle);
            }
            Err(e) => println!("  {} {e}", "✗".red()),
        }
    }

    fn with_run(&self, f: impl FnOnce(&RunHandle), done: &str) {
        match &self.run {
            Some(run) => {
                f(run);
                println!("  {} {done}", "✓".green());
            }
            None => println!("  {} no run is active", "✗".red()),
        }
    }

    fn reap_finished_run(&mut self) {
        if self.run.as_ref().is_some_and(RunHandle::is_finished) {
            if let Some(run) = self.run.take() {
                let report = self.runtime.block_on(run.wait());
                println!();
                print_report(&report);
                prompt();
            }
        }
    }

    fn finish_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.stop();
            print_report(&self.runtime.block_on(run.wait()));
        }
    }

    /// Run a blocking controller call; prints the error and returns `false`
    /// on failure.
    fn blocking<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> Result<(), lasercore_types::HardwareError> + Send + 'static,
    {
        match self.runtime.block_on(tokio::task::spawn_blocking(f)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                println!("  {} {e}", "✗".red());
                false
            }
            Err(e) => {
                println!("  {} {e}", "✗".red());
                false
            }
        }
    }
}

fn print_report(report: &RunReport) {
    let outcome = match &report.outcome {
        RunOutcome::Completed => "completed".green().bold(),
        RunOutcome::Aborted { reason } => format!("aborted ({reason:?})").yellow().bold(),
        RunOutcome::Faulted { error } => format!("faulted: {error}").red().bold(),
    };
    println!(
        "  Run {} {outcome} after {:.1} s, {} line(s), {} retr{}",
        report.run_id,
        report.elapsed.as_secs_f64(),
        report.lines_completed,
        report.retries,
        if report.retries == 1 { "y" } else { "ies" }
    );
    for failure in &report.tolerated {
        println!(
            "    {} line {} {}: {}",
            "⚠".yellow(),
            failure.line,
            failure.action,
            failure.error
        );
    }
}

fn help() {
    let rows = [
        ("/status", "safety state, interlocks, devices, run progress"),
        ("/connect [<device> <channel>]", "connect one device, or all"),
        ("/disconnect <device>", "release a device channel"),
        ("/session start|end", "open or close the treatment session"),
        ("/validate <file>", "load and validate a protocol (.json/.toml)"),
        ("/run <file>", "start a protocol"),
        ("/pause  /resume  /stop", "control the active run"),
        ("/estop", "emergency stop"),
        ("/reset", "reset from Unsafe, or request an emergency reset token"),
        ("/confirm-reset <token>", "leave emergency stop"),
        ("/aim on|off", "aiming beam"),
        ("/pedal down|up", "simulated footpedal"),
        ("/schema", "protocol document JSON Schema"),
        ("/quit", "shut down and exit"),
    ];
    println!();
    println!("{}", "LaserCore Commands".bold().underline());
    for (cmd, what) in rows {
        println!("  {:<32} {what}", cmd.bold().cyan());
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_commands() {
        assert_eq!(
            "/connect laser /dev/ttyUSB3".parse::<Command>(),
            Ok(Command::Connect(Some((DeviceKind::Laser, "/dev/ttyUSB3".into()))))
        );
        assert_eq!("/connect".parse::<Command>(), Ok(Command::Connect(None)));
        assert_eq!(
            "/disconnect mcu".parse::<Command>(),
            Ok(Command::Disconnect(DeviceKind::Interlock))
        );
        assert!("/connect laser".parse::<Command>().is_err());
        assert!("/disconnect toaster".parse::<Command>().is_err());
    }

    #[test]
    fn parses_switches() {
        assert_eq!("/session start".parse(), Ok(Command::Session { start: true }));
        assert_eq!("/session end".parse(), Ok(Command::Session { start: false }));
        assert_eq!("/aim off".parse(), Ok(Command::Aim(false)));
        assert_eq!("/pedal down".parse(), Ok(Command::Pedal(true)));
        assert!("/aim maybe".parse::<Command>().is_err());
    }

    #[test]
    fn confirm_reset_needs_a_token() {
        let token = Uuid::new_v4();
        assert_eq!(
            format!("/confirm-reset {token}").parse(),
            Ok(Command::ConfirmReset(token))
        );
        assert!("/confirm-reset".parse::<Command>().is_err());
        assert!("/confirm-reset nope".parse::<Command>().is_err());
    }

    #[test]
    fn file_commands_keep_the_path() {
        assert_eq!(
            "/run protocols/acne.toml".parse(),
            Ok(Command::Run(PathBuf::from("protocols/acne.toml")))
        );
        assert!("/validate".parse::<Command>().is_err());
    }

    #[test]
    fn unknown_commands_are_named() {
        let err = "/launch".parse::<Command>().unwrap_err();
        assert!(err.contains("/launch"));
        assert_eq!("/exit".parse(), Ok(Command::Quit));
    }
}
