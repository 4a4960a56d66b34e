//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::time::Duration;

/// Heartbeat request sent by the agent.
pub const PING: &str = "* PING";

/// Protocol control line (lines starting with `*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// Heartbeat request.
    Ping,
    /// Heartbeat response carrying the adapter's heartbeat period, when parseable.
    Pong(Option<Duration>),
    /// `* name: value` command.
    Command {
        /// Command name.
        name: String,
        /// Command argument.
        value: String,
    },
    /// Any other control text.
    Other(String),
}

/// Classify a control line. Returns `None` for lines that do not start with `*`.
pub fn parse_control(line: &str) -> Option<ControlLine> {
    let body = line.trim().strip_prefix('*')?.trim();

    let mut words = body.split_whitespace();
    match words.next() {
        Some("PING") if words.next().is_none() => return Some(ControlLine::Ping),
        Some("PONG") => {
            let heartbeat = words
                .next()
                .and_then(|ms| ms.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
            return Some(ControlLine::Pong(heartbeat));
        }
        _ => {}
    }

    if let Some((name, value)) = body.split_once(':') {
        let name = name.trim();
        if !name.is_empty() && !name.contains(char::is_whitespace) {
            return Some(ControlLine::Command {
                name: name.to_owned(),
                value: value.trim().to_owned(),
            });
        }
    }

    Some(ControlLine::Other(body.to_owned()))
}

/// `* PONG <ms>` reply for the given heartbeat period.
pub fn pong_line(heartbeat: Duration) -> String {
    format!("* PONG {}", heartbeat.as_millis())
}

/// `* <name>: <value>` command line.
pub fn command_line(name: &str, value: &str) -> String {
    format!("* {}: {}", name, value)
}
