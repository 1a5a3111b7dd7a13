//! Chat room on top of the relay.
//!
//! Every stdin line is broadcast as `/message` with one string argument.
//! Lines starting with `/` are commands that drive the node instead.

use presence_core::{Arg, Message, Peer, RelayedMessage};

pub const CHAT_ADDRESS: &str = "/message";

/// Something typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Broadcast a chat line
    Say(String),
    /// `/name <name>`
    Name(String),
    /// `/room <group>[,<group>...]`
    Room(String),
    /// `/enter`: send a discovery request
    Enter,
    /// `/leave`: disconnect from every peer
    Leave,
    /// `/members`
    Members,
}

impl ChatCommand {
    /// Parse one input line. Blank lines and unknown commands yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Say(line.to_string()));
        };

        let (verb, rest) = match command.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (command, ""),
        };
        match (verb, rest) {
            ("name", name) if !name.is_empty() => Some(Self::Name(name.to_string())),
            ("room", room) => Some(Self::Room(room.to_string())),
            ("enter", _) => Some(Self::Enter),
            ("leave", _) => Some(Self::Leave),
            ("members", _) => Some(Self::Members),
            _ => None,
        }
    }
}

pub fn chat_message(text: &str) -> Message {
    Message::new(CHAT_ADDRESS).with_arg(text)
}

/// `name(ip):text` for a received chat line, or `None` if it is not one.
///
/// The sender is looked up in `peers`; unknown senders show as `unknown`.
pub fn format_chat(message: &RelayedMessage, peers: &[Peer]) -> Option<String> {
    if message.address != CHAT_ADDRESS {
        return None;
    }
    let Some(Arg::Str(text)) = message.args.first() else {
        return None;
    };
    let name = peers
        .iter()
        .find(|p| p.address == message.sender)
        .map(|p| p.name.as_str())
        .unwrap_or("unknown");
    Some(format!("{}({}):{}", name, message.sender, text))
}

/// One line per peer: `name(ip) [state]`.
pub fn format_members(peers: &[Peer]) -> String {
    let mut out = format!("Members({})", peers.len());
    for peer in peers {
        out.push_str(&format!("\n  {}({}) [{:?}]", peer.name, peer.address, peer.state));
    }
    out
}
