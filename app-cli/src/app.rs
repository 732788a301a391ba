use std::io;
use std::sync::Arc;

use log::{info, warn};
use wgtunnel_core::direct::DirectTransport;
use wgtunnel_core::platform::{AppPaths, Notifier};
use wgtunnel_core::{
    ChannelBridge, ConfigStore, EventLoop, LifecycleController, OutboundBuffer, Router,
    StartOutcome, Transport, TunnelContext,
};

use crate::commands::{Command, HELP};
use crate::notify::TerminalNotifier;
use crate::paths::CliPaths;
use crate::session::PrintHandler;

/// Everything the shell drives: the tunnel lifecycle and at most one session.
pub struct AppState {
    pub controller: LifecycleController,
    router: Router,
    event_loop: EventLoop,
    channel: Option<Arc<ChannelBridge>>,
}

impl AppState {
    pub fn new(paths: CliPaths) -> io::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(DirectTransport::new());
        let notifier: Arc<dyn Notifier> = Arc::new(TerminalNotifier);
        Self::with_parts(paths, transport, notifier)
    }

    pub fn with_parts(
        paths: CliPaths,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> io::Result<Self> {
        info!("Using config at {:?}", paths.config_path());
        let config = ConfigStore::load(Arc::new(paths));
        let ctx = TunnelContext::new(transport, config, notifier);
        let router = Router::new(Arc::clone(&ctx), Arc::new(DirectTransport::ready()));

        Ok(Self {
            controller: LifecycleController::new(ctx),
            router,
            event_loop: EventLoop::spawn("wgtunnel-channel")?,
            channel: None,
        })
    }

    /// Run one command. Returns `false` when the shell should exit.
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start => match self.controller.start() {
                Ok(StartOutcome::Started) => info!("Tunnel start requested"),
                Ok(outcome) => info!("Start ignored: {outcome:?}"),
                Err(e) => eprintln!("start failed: {e}"),
            },
            Command::Stop => {
                self.close_channel();
                self.controller.stop();
            }
            Command::Toggle => {
                let enabled = self.controller.toggle();
                if !enabled {
                    self.close_channel();
                }
                println!("tunnel {}", if enabled { "enabled" } else { "disabled" });
            }
            Command::Status => println!("{}", self.status()),
            Command::Connect(remote) => self.connect(remote),
            Command::Send(text) => self.send(text),
            Command::Close => {
                if !self.close_channel() {
                    println!("no open session");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }

    pub fn status(&self) -> String {
        let ctx = self.controller.context();
        let mut lines = vec![
            format!("tunnel:     {}", self.controller.state()),
            format!("enabled:    {}", ctx.config().is_enabled()),
            format!("engine:     {}", ctx.transport().tunnel_state()),
            format!("ready:      {}", self.controller.is_ready()),
            format!("connecting: {}", self.controller.is_connecting()),
        ];
        if let Some(reason) = self.controller.failure_reason() {
            lines.push(format!("last error: {reason}"));
        }
        match &self.channel {
            Some(channel) => lines.push(format!(
                "session:    {:?} via {} {}",
                channel.state(),
                channel.route(),
                channel
                    .remote_address()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            )),
            None => lines.push("session:    none".to_string()),
        }
        lines.join("\n")
    }

    fn connect(&mut self, remote: std::net::SocketAddr) {
        if self.channel.as_ref().is_some_and(|c| c.is_open()) {
            println!("a session is already open, close it first");
            return;
        }

        let timeout = self
            .controller
            .context()
            .config()
            .snapshot()
            .connection
            .connect_timeout();
        let channel: Arc<ChannelBridge> = Arc::new(self.router.channel(
            self.event_loop.handle(),
            Arc::new(PrintHandler::new(remote.to_string())),
        ));

        match channel.connect(remote, timeout).wait() {
            Ok(()) => {
                if let Err(e) = channel.begin_read() {
                    warn!("Failed to start reading from {remote}: {e}");
                }
                self.channel = Some(channel);
            }
            Err(e) => eprintln!("connect to {remote} failed: {e}"),
        }
    }

    fn send(&mut self, text: String) {
        let Some(channel) = self.channel.clone() else {
            println!("no open session");
            return;
        };

        let result = self.event_loop.handle().call(move || {
            let mut out = OutboundBuffer::new();
            out.push(format!("{text}\n").into_bytes());
            channel.write(&mut out)
        });
        match result {
            Some(Ok(n)) => info!("Sent {n} bytes"),
            Some(Err(e)) => eprintln!("send failed: {e}"),
            None => eprintln!("send failed: channel loop is gone"),
        }
    }

    fn close_channel(&mut self) -> bool {
        match self.channel.take() {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn cleanup(&mut self) {
        info!("Cleaning up before exit");
        self.close_channel();
        self.controller.shutdown();
    }
}
