//! Terminal end of a tunnel channel: prints whatever the remote sends.

use log::{debug, warn};
use wgtunnel_core::{ChannelError, ChannelHandler};

pub struct PrintHandler {
    label: String,
}

impl PrintHandler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ChannelHandler for PrintHandler {
    fn channel_active(&self) {
        println!("{}: connected", self.label);
    }

    fn channel_read(&self, data: Vec<u8>) {
        debug!("{}: received {} bytes", self.label, data.len());
        println!("{}< {}", self.label, String::from_utf8_lossy(&data).trim_end());
    }

    fn input_shutdown(&self) {
        println!("{}: remote closed its side", self.label);
    }

    fn exception_caught(&self, error: ChannelError) {
        warn!("{}: {error}", self.label);
        eprintln!("{}: error: {error}", self.label);
    }

    fn channel_inactive(&self) {
        println!("{}: disconnected", self.label);
    }
}
