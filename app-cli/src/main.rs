//! Terminal shell for wgtunnel.
//! Reads commands from stdin and drives the tunnel and one test session.

mod app;
mod commands;
mod notify;
mod paths;
mod session;

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

use crate::app::AppState;
use crate::commands::Command;
use crate::paths::CliPaths;

/// Route TCP sessions through a user-space tunnel.
#[derive(Parser)]
#[command(name = "wgtunnel", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the tunnel credentials file
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Bring the tunnel up once at startup if it is enabled
    #[arg(long)]
    boot: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("starting wgtunnel (terminal shell)");

    let mut app = AppState::new(CliPaths {
        config: cli.config,
        credentials: cli.credentials,
    })?;

    if cli.boot {
        if let Err(e) = app.controller.boot() {
            warn!("tunnel boot failed: {e}; use 'start' to retry");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("received signal, shutting down");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let lines = spawn_stdin_reader()?;
    let mut repl = Repl {
        app,
        lines,
        running,
    };
    repl.run();
    Ok(())
}

struct Repl {
    app: AppState,
    lines: Receiver<String>,
    running: Arc<AtomicBool>,
}

impl Repl {
    fn run(&mut self) {
        info!("shell ready; type 'help' for commands");
        prompt();

        while self.running.load(Ordering::SeqCst) {
            match self.lines.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => {
                    if !self.handle_line(&line) {
                        break;
                    }
                    prompt();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("stdin closed");
                    break;
                }
            }
        }

        info!("exiting shell; cleaning up");
        self.app.cleanup();
    }

    fn handle_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        match line.parse::<Command>() {
            Ok(command) => self.app.handle(command),
            Err(e) => {
                eprintln!("{e}");
                true
            }
        }
    }
}

fn prompt() {
    print!("wgtunnel> ");
    let _ = io::stdout().flush();
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("failed to read stdin: {e}");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}
