use log::{error, info, warn};
use wgtunnel_core::platform::Notifier;

/// Prints notifications to the terminal and mirrors them into the log.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn info(&self, title: &str, body: &str) {
        info!("{title}: {body}");
        println!("[{title}] {body}");
    }

    fn warn(&self, title: &str, body: &str) {
        warn!("{title}: {body}");
        println!("[{title}] {body}");
    }

    fn error(&self, title: &str, body: &str) {
        error!("{title}: {body}");
        eprintln!("[{title}] {body}");
    }
}
