use std::net::SocketAddr;
use std::str::FromStr;

pub const HELP: &str = "\
commands:
  start             bring the tunnel up, retrying until it is ready
  stop              tear the tunnel down
  toggle            flip the persisted enabled flag
  status            show tunnel and session state
  connect <ip:port> open a session through the tunnel
  send <text>       write a line to the open session
  close             close the open session
  help              show this list
  quit              shut down and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Toggle,
    Status,
    Connect(SocketAddr),
    Send(String),
    Close,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));

        let bare = |command: Command| {
            if rest.is_empty() {
                Ok(command)
            } else {
                Err(format!("'{word}' takes no arguments"))
            }
        };

        match word.to_ascii_lowercase().as_str() {
            "start" => bare(Command::Start),
            "stop" => bare(Command::Stop),
            "toggle" => bare(Command::Toggle),
            "status" => bare(Command::Status),
            "close" => bare(Command::Close),
            "help" | "?" => bare(Command::Help),
            "quit" | "exit" => bare(Command::Quit),
            "connect" => rest
                .parse()
                .map(Command::Connect)
                .map_err(|_| format!("expected an ip:port address, got '{rest}'")),
            "send" if !rest.is_empty() => Ok(Command::Send(rest.to_string())),
            "send" => Err("nothing to send".to_string()),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}
