//! Commands
//!
//! Parsed, immutable commands. Each carries the stream offset at which
//! it began so a follower can answer REPLCONF GETACK exactly.

mod execute;

pub use execute::ExecContext;

use bytes::Bytes;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::store::now_millis;

/// REPLCONF sub-commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replconf {
    ListeningPort(u16),
    Capa(Vec<String>),
    GetAck,
    Ack(u64),
}

/// Every command kind this server understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        /// Absolute expiry in unix milliseconds
        expires_at: Option<i64>,
    },
    Del(Vec<Bytes>),
    Incr(Bytes),
    Keys(Bytes),
    Type(Bytes),
    Info(Option<String>),
    ConfigGet(Vec<String>),
    Replconf(Replconf),
    Psync {
        replid: String,
        offset: i64,
    },
    Wait {
        replicas: usize,
        timeout: Duration,
    },
    /// Stops the command loop after the current tick
    Shutdown,
}

/// A parsed command and where it started in its connection's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub start_offset: u64,
}

impl Command {
    /// Parse a protocol value (an array of bulk strings)
    pub fn parse(value: RespValue, start_offset: u64) -> Result<Self> {
        let args = match value {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::BulkString(b) => Ok(b),
                    RespValue::SimpleString(s) => Ok(Bytes::from(s)),
                    RespValue::Integer(n) => Ok(Bytes::from(n.to_string())),
                    other => Err(Error::InvalidCommand(format!(
                        "Protocol error: unexpected {} in command",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<Bytes>>>()?,
            other => {
                return Err(Error::InvalidCommand(format!(
                    "Protocol error: expected array, got {}",
                    other.type_name()
                )));
            }
        };

        let kind = parse_kind(args)?;
        Ok(Command { kind, start_offset })
    }

    /// Lowercase type tag
    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Ping(_) => "ping",
            CommandKind::Echo(_) => "echo",
            CommandKind::Get(_) => "get",
            CommandKind::Set { .. } => "set",
            CommandKind::Del(_) => "del",
            CommandKind::Incr(_) => "incr",
            CommandKind::Keys(_) => "keys",
            CommandKind::Type(_) => "type",
            CommandKind::Info(_) => "info",
            CommandKind::ConfigGet(_) => "config",
            CommandKind::Replconf(_) => "replconf",
            CommandKind::Psync { .. } => "psync",
            CommandKind::Wait { .. } => "wait",
            CommandKind::Shutdown => "shutdown",
        }
    }

    /// Commands that change the key space and are forwarded to followers
    pub fn is_replicated(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Set { .. } | CommandKind::Del(_) | CommandKind::Incr(_)
        )
    }

    /// Canonical array form, as forwarded to followers
    pub fn to_value(&self) -> RespValue {
        let mut parts: Vec<Bytes> = Vec::new();

        match &self.kind {
            CommandKind::Ping(message) => {
                parts.push(word("PING"));
                parts.extend(message.iter().cloned());
            }
            CommandKind::Echo(message) => {
                parts.push(word("ECHO"));
                parts.push(message.clone());
            }
            CommandKind::Get(key) => {
                parts.push(word("GET"));
                parts.push(key.clone());
            }
            CommandKind::Set {
                key,
                value,
                expires_at,
            } => {
                parts.push(word("SET"));
                parts.push(key.clone());
                parts.push(value.clone());
                if let Some(at) = expires_at {
                    parts.push(word("PXAT"));
                    parts.push(Bytes::from(at.to_string()));
                }
            }
            CommandKind::Del(keys) => {
                parts.push(word("DEL"));
                parts.extend(keys.iter().cloned());
            }
            CommandKind::Incr(key) => {
                parts.push(word("INCR"));
                parts.push(key.clone());
            }
            CommandKind::Keys(pattern) => {
                parts.push(word("KEYS"));
                parts.push(pattern.clone());
            }
            CommandKind::Type(key) => {
                parts.push(word("TYPE"));
                parts.push(key.clone());
            }
            CommandKind::Info(section) => {
                parts.push(word("INFO"));
                parts.extend(section.iter().map(|s| Bytes::from(s.clone())));
            }
            CommandKind::ConfigGet(names) => {
                parts.push(word("CONFIG"));
                parts.push(word("GET"));
                parts.extend(names.iter().map(|s| Bytes::from(s.clone())));
            }
            CommandKind::Replconf(sub) => {
                parts.push(word("REPLCONF"));
                match sub {
                    Replconf::ListeningPort(port) => {
                        parts.push(word("listening-port"));
                        parts.push(Bytes::from(port.to_string()));
                    }
                    Replconf::Capa(caps) => {
                        for cap in caps {
                            parts.push(word("capa"));
                            parts.push(Bytes::from(cap.clone()));
                        }
                    }
                    Replconf::GetAck => {
                        parts.push(word("GETACK"));
                        parts.push(word("*"));
                    }
                    Replconf::Ack(offset) => {
                        parts.push(word("ACK"));
                        parts.push(Bytes::from(offset.to_string()));
                    }
                }
            }
            CommandKind::Psync { replid, offset } => {
                parts.push(word("PSYNC"));
                parts.push(Bytes::from(replid.clone()));
                parts.push(Bytes::from(offset.to_string()));
            }
            CommandKind::Wait { replicas, timeout } => {
                parts.push(word("WAIT"));
                parts.push(Bytes::from(replicas.to_string()));
                parts.push(Bytes::from(timeout.as_millis().to_string()));
            }
            CommandKind::Shutdown => parts.push(word("SHUTDOWN")),
        }

        RespValue::Array(parts.into_iter().map(RespValue::BulkString).collect())
    }

    /// Wire bytes of [`Command::to_value`]
    pub fn to_wire(&self) -> Bytes {
        self.to_value().to_bytes()
    }
}

impl From<CommandKind> for Command {
    fn from(kind: CommandKind) -> Self {
        Command {
            kind,
            start_offset: 0,
        }
    }
}

fn parse_kind(args: Vec<Bytes>) -> Result<CommandKind> {
    let Some((name, rest)) = args.split_first() else {
        return Err(Error::InvalidCommand("empty command".into()));
    };
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();

    let arity = |min: usize, max: Option<usize>| -> Result<()> {
        if rest.len() < min || max.map_or(false, |m| rest.len() > m) {
            return Err(Error::InvalidCommand(format!(
                "wrong number of arguments for '{}' command",
                name
            )));
        }
        Ok(())
    };

    let kind = match name.as_str() {
        "ping" => {
            arity(0, Some(1))?;
            CommandKind::Ping(rest.first().cloned())
        }
        "echo" => {
            arity(1, Some(1))?;
            CommandKind::Echo(rest[0].clone())
        }
        "get" => {
            arity(1, Some(1))?;
            CommandKind::Get(rest[0].clone())
        }
        "set" => {
            arity(2, None)?;
            parse_set(rest)?
        }
        "del" => {
            arity(1, None)?;
            CommandKind::Del(rest.to_vec())
        }
        "incr" => {
            arity(1, Some(1))?;
            CommandKind::Incr(rest[0].clone())
        }
        "keys" => {
            arity(1, Some(1))?;
            CommandKind::Keys(rest[0].clone())
        }
        "type" => {
            arity(1, Some(1))?;
            CommandKind::Type(rest[0].clone())
        }
        "info" => {
            arity(0, Some(1))?;
            CommandKind::Info(rest.first().map(|s| text(s).to_ascii_lowercase()))
        }
        "config" => {
            arity(2, None)?;
            if !text(&rest[0]).eq_ignore_ascii_case("get") {
                return Err(Error::InvalidCommand(format!(
                    "unknown subcommand '{}' for 'config'",
                    text(&rest[0])
                )));
            }
            CommandKind::ConfigGet(rest[1..].iter().map(|s| text(s).to_ascii_lowercase()).collect())
        }
        "replconf" => {
            arity(2, None)?;
            CommandKind::Replconf(parse_replconf(rest)?)
        }
        "psync" => {
            arity(2, Some(2))?;
            CommandKind::Psync {
                replid: text(&rest[0]),
                offset: parse_int(&rest[1])?,
            }
        }
        "wait" => {
            arity(2, Some(2))?;
            let replicas = parse_int(&rest[0])?;
            let timeout = parse_int(&rest[1])?;
            if replicas < 0 || timeout < 0 {
                return Err(Error::InvalidCommand("timeout is negative".into()));
            }
            CommandKind::Wait {
                replicas: replicas as usize,
                timeout: Duration::from_millis(timeout as u64),
            }
        }
        "shutdown" => {
            arity(0, Some(1))?;
            CommandKind::Shutdown
        }
        _ => return Err(Error::UnknownCommand(name)),
    };

    Ok(kind)
}

fn parse_set(rest: &[Bytes]) -> Result<CommandKind> {
    let key = rest[0].clone();
    let value = rest[1].clone();
    let mut expires_at = None;

    let mut options = rest[2..].iter();
    while let Some(option) = options.next() {
        let option = text(option).to_ascii_uppercase();
        let amount = match option.as_str() {
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let raw = options.next().ok_or_else(|| Error::InvalidCommand("syntax error".into()))?;
                parse_int(raw)?
            }
            _ => return Err(Error::InvalidCommand("syntax error".into())),
        };
        if amount <= 0 || expires_at.is_some() {
            return Err(Error::InvalidCommand("invalid expire time in 'set' command".into()));
        }

        // relative expiries become absolute so followers expire at the same instant
        let at = match option.as_str() {
            "EX" => amount.checked_mul(1000).and_then(|ms| now_millis().checked_add(ms)),
            "PX" => now_millis().checked_add(amount),
            "EXAT" => amount.checked_mul(1000),
            _ => Some(amount),
        }
        .ok_or_else(|| Error::InvalidCommand("invalid expire time in 'set' command".into()))?;
        expires_at = Some(at);
    }

    Ok(CommandKind::Set {
        key,
        value,
        expires_at,
    })
}

fn parse_replconf(rest: &[Bytes]) -> Result<Replconf> {
    let sub = text(&rest[0]).to_ascii_lowercase();
    match sub.as_str() {
        "listening-port" => {
            let port = text(&rest[1])
                .parse::<u16>()
                .map_err(|_| Error::InvalidCommand("invalid listening-port".into()))?;
            Ok(Replconf::ListeningPort(port))
        }
        "capa" => {
            let mut caps = vec![text(&rest[1])];
            let mut extra = rest[2..].chunks(2);
            for pair in &mut extra {
                if pair.len() == 2 && text(&pair[0]).eq_ignore_ascii_case("capa") {
                    caps.push(text(&pair[1]));
                } else {
                    return Err(Error::InvalidCommand("syntax error in REPLCONF capa".into()));
                }
            }
            Ok(Replconf::Capa(caps))
        }
        "getack" => Ok(Replconf::GetAck),
        "ack" => {
            let offset = parse_int(&rest[1])?;
            if offset < 0 {
                return Err(Error::InvalidCommand("negative ACK offset".into()));
            }
            Ok(Replconf::Ack(offset as u64))
        }
        other => Err(Error::InvalidCommand(format!(
            "unrecognized REPLCONF option: {}",
            other
        ))),
    }
}

fn word(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

fn text(raw: &Bytes) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn parse_int(raw: &Bytes) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::InvalidCommand("value is not an integer or out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Result<Command> {
        Command::parse(RespValue::command(parts), 0)
    }

    #[test]
    fn test_case_insensitive_names() {
        assert_eq!(cmd(&["pInG"]).unwrap().kind, CommandKind::Ping(None));
        assert_eq!(cmd(&["GET", "k"]).unwrap().name(), "get");
    }

    #[test]
    fn test_arity_and_unknown() {
        assert!(matches!(cmd(&["GET"]), Err(Error::InvalidCommand(_))));
        assert!(matches!(cmd(&["FLY", "away"]), Err(Error::UnknownCommand(n)) if n == "fly"));
        assert!(matches!(
            Command::parse(RespValue::Integer(1), 0),
            Err(Error::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_relative_expiry_forwarded_as_pxat() {
        let before = now_millis();
        let set = cmd(&["SET", "k", "v", "EX", "10"]).unwrap();
        let CommandKind::Set { expires_at: Some(at), .. } = set.kind else {
            panic!("expected SET with expiry");
        };
        assert!(at >= before + 10_000 && at <= now_millis() + 10_000);

        let RespValue::Array(parts) = set.to_value() else {
            panic!("expected array");
        };
        assert_eq!(parts[3], RespValue::bulk("PXAT"));
        assert_eq!(parts[4], RespValue::bulk(at.to_string()));
    }

    #[test]
    fn test_set_rejects_bad_options() {
        assert!(cmd(&["SET", "k", "v", "EX"]).is_err());
        assert!(cmd(&["SET", "k", "v", "EX", "0"]).is_err());
        assert!(cmd(&["SET", "k", "v", "NOPE"]).is_err());
        assert!(cmd(&["SET", "k", "v", "PX", "5", "EX", "5"]).is_err());
    }

    #[test]
    fn test_replconf_variants() {
        assert_eq!(
            cmd(&["REPLCONF", "listening-port", "6380"]).unwrap().kind,
            CommandKind::Replconf(Replconf::ListeningPort(6380))
        );
        assert_eq!(
            cmd(&["REPLCONF", "capa", "eof", "capa", "psync2"]).unwrap().kind,
            CommandKind::Replconf(Replconf::Capa(vec!["eof".into(), "psync2".into()]))
        );
        assert_eq!(
            cmd(&["REPLCONF", "GETACK", "*"]).unwrap().kind,
            CommandKind::Replconf(Replconf::GetAck)
        );
        assert_eq!(
            cmd(&["REPLCONF", "ACK", "154"]).unwrap().kind,
            CommandKind::Replconf(Replconf::Ack(154))
        );
        assert!(cmd(&["REPLCONF", "ACK", "-1"]).is_err());
    }

    #[test]
    fn test_getack_wire_length() {
        let getack = Command::from(CommandKind::Replconf(Replconf::GetAck));
        assert_eq!(&getack.to_wire()[..], b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n");
        assert_eq!(getack.to_wire().len(), 37);
    }

    #[test]
    fn test_replicated_flag() {
        assert!(cmd(&["SET", "a", "b"]).unwrap().is_replicated());
        assert!(cmd(&["DEL", "a"]).unwrap().is_replicated());
        assert!(cmd(&["INCR", "a"]).unwrap().is_replicated());
        assert!(!cmd(&["GET", "a"]).unwrap().is_replicated());
        assert!(!cmd(&["WAIT", "1", "0"]).unwrap().is_replicated());
    }

    #[test]
    fn test_wait_parse() {
        assert_eq!(
            cmd(&["WAIT", "2", "500"]).unwrap().kind,
            CommandKind::Wait {
                replicas: 2,
                timeout: Duration::from_millis(500)
            }
        );
        assert!(cmd(&["WAIT", "1", "-5"]).is_err());
    }
}
