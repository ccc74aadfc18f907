//! Console command parsing for the interactive node shell.
//!
//! `ConsoleCommand` is what an operator types; only some commands become
//! replicated [`Operation`](crate::command::Operation)s. READ, STATUS and
//! friends are answered from local state.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};

pub const HELP: &str = "\
CREATE/cr <path> <content>           create a file
WRITE/w <path> <version> <content>   write a new version, expecting <version>
READ/r <path>                        show the latest version
HISTORY/hi <path>                    list every version
DELETE/d <path>                      delete a file
LEASE/l <path> <seconds>             take or renew the write lease
RELEASE/rl <path>                    give the lease back
LIST/ls                              list files
STATUS/s                             show role, term and leader
CAMPAIGN/c                           start an election on this node
HELP/h                               this text
EXIT/e                               stop the node";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Create { path: String, content: String },
    Write { path: String, expected_version: u64, content: String },
    Read { path: String },
    History { path: String },
    Delete { path: String },
    Lease { path: String, duration: Duration },
    Release { path: String },
    List,
    Status,
    Campaign,
    Help,
    Exit,
}

/// Splits `count` words off the front of `input` and returns them with
/// the untouched remainder.
fn split_words(input: &str, count: usize) -> (Vec<&str>, &str) {
    let mut words = Vec::with_capacity(count);
    let mut rest = input.trim_start();
    while words.len() < count && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        words.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (words, rest)
}

impl ConsoleCommand {
    /// Parses a line of operator input. Command names are case-insensitive
    /// and have short aliases; file contents run to the end of the line.
    pub fn parse(line: &str) -> Result<Self> {
        let (head, rest) = split_words(line, 1);
        let Some(cmd) = head.first() else {
            bail!("empty command");
        };
        let cmd = match cmd.to_uppercase().as_str() {
            "CR" => "CREATE".to_string(),
            "W" => "WRITE".to_string(),
            "R" => "READ".to_string(),
            "HI" => "HISTORY".to_string(),
            "D" => "DELETE".to_string(),
            "L" => "LEASE".to_string(),
            "RL" => "RELEASE".to_string(),
            "LS" => "LIST".to_string(),
            "S" => "STATUS".to_string(),
            "C" => "CAMPAIGN".to_string(),
            "H" => "HELP".to_string(),
            "E" => "EXIT".to_string(),
            other => other.to_string(),
        };

        match cmd.as_str() {
            "LIST" => return Ok(ConsoleCommand::List),
            "STATUS" => return Ok(ConsoleCommand::Status),
            "CAMPAIGN" => return Ok(ConsoleCommand::Campaign),
            "HELP" => return Ok(ConsoleCommand::Help),
            "EXIT" => return Ok(ConsoleCommand::Exit),
            _ => {}
        }

        match cmd.as_str() {
            "CREATE" => match split_words(rest, 1) {
                (words, content) if words.len() == 1 => Ok(ConsoleCommand::Create {
                    path: words[0].to_string(),
                    content: content.to_string(),
                }),
                _ => Err(anyhow!("usage: CREATE <path> <content>")),
            },
            "WRITE" => match split_words(rest, 2) {
                (words, content) if words.len() == 2 => {
                    let expected_version = words[1]
                        .parse()
                        .map_err(|_| anyhow!("version must be a number, got {:?}", words[1]))?;
                    Ok(ConsoleCommand::Write {
                        path: words[0].to_string(),
                        expected_version,
                        content: content.to_string(),
                    })
                }
                _ => Err(anyhow!("usage: WRITE <path> <version> <content>")),
            },
            "LEASE" => match split_words(rest, 2) {
                (words, "") if words.len() == 2 => {
                    let secs: f64 = words[1]
                        .parse()
                        .map_err(|_| anyhow!("duration must be seconds, got {:?}", words[1]))?;
                    let duration = Duration::try_from_secs_f64(secs)
                        .map_err(|_| anyhow!("invalid duration {secs}"))?;
                    Ok(ConsoleCommand::Lease {
                        path: words[0].to_string(),
                        duration,
                    })
                }
                _ => Err(anyhow!("usage: LEASE <path> <seconds>")),
            },
            "READ" | "HISTORY" | "DELETE" | "RELEASE" => {
                let (words, extra) = split_words(rest, 1);
                if words.len() != 1 || !extra.is_empty() {
                    bail!("usage: {cmd} <path>");
                }
                let path = words[0].to_string();
                Ok(match cmd.as_str() {
                    "READ" => ConsoleCommand::Read { path },
                    "HISTORY" => ConsoleCommand::History { path },
                    "DELETE" => ConsoleCommand::Delete { path },
                    _ => ConsoleCommand::Release { path },
                })
            }
            _ => Err(anyhow!("invalid command, type HELP for the list")),
        }
    }
}
