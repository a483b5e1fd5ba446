//! warmsh daemon binary
//!
//! Provides commands to start, stop, and inspect the session daemon.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::env;
use std::fs;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use warmsh::daemon::{DaemonConfig, SessionClient, SessionServer};
use warmsh::logging;
use warmsh::shell::CommandShell;
use warmsh::signal::DaemonSignals;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = &args[1];
    let config = DaemonConfig::load()?;

    match command.as_str() {
        "start" => start_daemon(config),
        "stop" => stop_daemon(&config),
        "status" => check_status(&config),
        "restart" => restart_daemon(config),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_daemon(config: DaemonConfig) -> Result<()> {
    config.ensure_state_dir()?;
    let socket_path = config.socket_path.clone();

    // Check if daemon is already running
    if socket_path.exists() {
        if SessionClient::is_daemon_running(&socket_path) {
            eprintln!("Error: Daemon is already running at {}", socket_path.display());
            eprintln!("Use 'warmshd stop' to stop it first, or 'warmshd restart' to restart.");
            process::exit(1);
        }
        // Stale socket file, remove it
        fs::remove_file(&socket_path)?;
    }

    logging::init_daemon(&config.log_path)?;
    let signals = DaemonSignals::register()?;

    println!("Starting warmsh daemon at {}", socket_path.display());
    println!("Shell: {}", config.shell.display());
    println!("Log: {}", config.log_path.display());

    let shell = CommandShell::new(config.shell.clone());
    let mut server = SessionServer::new(config, shell);
    server.bind()?;
    info!("daemon {} started", process::id());

    if let Err(e) = server.run(&signals) {
        error!("daemon stopped: {:#}", e);
        eprintln!("Error: {:#}", e);
        drop(server);
        process::exit(1);
    }
    info!("daemon {} stopped", process::id());
    Ok(())
}

fn read_pid(config: &DaemonConfig) -> Result<Option<Pid>> {
    if !config.pid_path.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(&config.pid_path)
        .with_context(|| format!("failed to read {}", config.pid_path.display()))?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", config.pid_path.display()))?;
    Ok(Some(Pid::from_raw(pid)))
}

fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    let socket_path = &config.socket_path;

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if !SessionClient::is_daemon_running(socket_path) {
        // Socket exists but can't connect - likely stale
        println!("Removing stale socket file.");
        fs::remove_file(socket_path)?;
        fs::remove_file(&config.pid_path).ok();
        return Ok(());
    }

    let Some(pid) = read_pid(config)? else {
        eprintln!("Warning: PID file not found. Cannot send signal to daemon.");
        eprintln!("You may need to manually kill the daemon process.");
        return Ok(());
    };

    kill(pid, Signal::SIGTERM).with_context(|| format!("failed to signal daemon {}", pid))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    eprintln!("Warning: Daemon may not have stopped cleanly.");
    fs::remove_file(&config.pid_path).ok();
    Ok(())
}

fn check_status(config: &DaemonConfig) -> Result<()> {
    let socket_path = &config.socket_path;

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if SessionClient::is_daemon_running(socket_path) {
        println!("Daemon is running at {}", socket_path.display());
        if let Ok(Some(pid)) = read_pid(config) {
            println!("PID: {}", pid);
        }
        println!("Shell: {}", config.shell.display());
    } else {
        println!("Socket file exists but daemon is not responding.");
        println!("This may be a stale socket. Try 'warmshd start' to restart.");
    }

    Ok(())
}

fn restart_daemon(config: DaemonConfig) -> Result<()> {
    println!("Stopping daemon...");
    stop_daemon(&config)?;

    // Brief pause to ensure cleanup
    thread::sleep(Duration::from_millis(500));

    println!("Starting daemon...");
    start_daemon(config)
}

fn print_usage() {
    println!("warmsh daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: warmshd <command>");
    println!();
    println!("Commands:");
    println!("  start      Start the daemon in the foreground");
    println!("  stop       Stop the daemon");
    println!("  status     Check daemon status");
    println!("  restart    Restart the daemon");
    println!("  -h, --help Show this help message");
    println!();
    println!("Environment:");
    println!("  WARMSH_HOME      State directory (default ~/.warmsh)");
    println!("  WARMSH_SHELL     Program each session runs (default $SHELL)");
    println!("  WARMSH_LOG       Log filter (default info)");
}
