//! Data and introspection command execution

use bytes::Bytes;

use super::{Command, CommandKind};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::replication::ReplicationState;
use crate::store::{glob_match, Store};

/// What a command may touch while executing
pub struct ExecContext<'a> {
    pub store: &'a mut Store,
    pub config: &'a RelayConfig,
    pub replication: &'a ReplicationState,
}

impl Command {
    /// Run against the store and produce the reply
    ///
    /// Replication commands (REPLCONF, PSYNC, WAIT, SHUTDOWN) belong to
    /// the command loop and are rejected here.
    pub fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<Option<RespValue>> {
        let reply = match &self.kind {
            CommandKind::Ping(None) => RespValue::simple("PONG"),
            CommandKind::Ping(Some(message)) => RespValue::BulkString(message.clone()),
            CommandKind::Echo(message) => RespValue::BulkString(message.clone()),
            CommandKind::Get(key) => match ctx.store.get(key) {
                Some(value) => RespValue::BulkString(value),
                None => RespValue::NullBulk,
            },
            CommandKind::Set {
                key,
                value,
                expires_at,
            } => {
                ctx.store.set(key.clone(), value.clone(), *expires_at);
                RespValue::ok()
            }
            CommandKind::Del(keys) => {
                let removed = keys.iter().filter(|key| ctx.store.delete(key)).count();
                RespValue::Integer(removed as i64)
            }
            CommandKind::Incr(key) => RespValue::Integer(ctx.store.incr(key)?),
            CommandKind::Keys(pattern) => RespValue::Array(
                ctx.store
                    .keys(pattern)
                    .into_iter()
                    .map(RespValue::BulkString)
                    .collect(),
            ),
            CommandKind::Type(key) => RespValue::simple(ctx.store.value_type(key)),
            CommandKind::Info(section) => info(ctx, section.as_deref()),
            CommandKind::ConfigGet(patterns) => config_get(ctx.config, patterns),
            CommandKind::Replconf(_)
            | CommandKind::Psync { .. }
            | CommandKind::Wait { .. }
            | CommandKind::Shutdown => {
                return Err(Error::Internal(format!(
                    "{} is handled by the command loop",
                    self.name()
                )));
            }
        };

        Ok(Some(reply))
    }
}

fn info(ctx: &ExecContext<'_>, section: Option<&str>) -> RespValue {
    match section {
        None | Some("replication") | Some("all") | Some("default") | Some("everything") => {
            RespValue::bulk(ctx.replication.info())
        }
        Some(_) => RespValue::bulk(Bytes::new()),
    }
}

fn config_get(config: &RelayConfig, patterns: &[String]) -> RespValue {
    let params: [(&str, String); 4] = [
        ("dir", config.storage.dir.display().to_string()),
        ("dbfilename", config.storage.dbfilename.clone()),
        ("port", config.node.port.to_string()),
        (
            "replicaof",
            config.replication.replicaof.clone().unwrap_or_default(),
        ),
    ];

    let mut reply = Vec::new();
    for (name, value) in params.iter() {
        if patterns.iter().any(|p| glob_match(p.as_bytes(), name.as_bytes())) {
            reply.push(RespValue::bulk(name.to_string()));
            reply.push(RespValue::bulk(value.clone()));
        }
    }
    RespValue::Array(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Role;

    fn run(store: &mut Store, parts: &[&str]) -> Result<Option<RespValue>> {
        let config = RelayConfig::default();
        let replication = ReplicationState::new(Role::Leader);
        let command = Command::parse(RespValue::command(parts), 0)?;
        let mut ctx = ExecContext {
            store,
            config: &config,
            replication: &replication,
        };
        command.execute(&mut ctx)
    }

    #[test]
    fn test_data_commands() {
        let mut store = Store::new();
        assert_eq!(run(&mut store, &["SET", "k", "v"]).unwrap(), Some(RespValue::ok()));
        assert_eq!(run(&mut store, &["GET", "k"]).unwrap(), Some(RespValue::bulk("v")));
        assert_eq!(run(&mut store, &["GET", "missing"]).unwrap(), Some(RespValue::NullBulk));
        assert_eq!(run(&mut store, &["TYPE", "k"]).unwrap(), Some(RespValue::simple("string")));
        assert_eq!(run(&mut store, &["INCR", "n"]).unwrap(), Some(RespValue::Integer(1)));
        assert_eq!(
            run(&mut store, &["KEYS", "*"]).unwrap(),
            Some(RespValue::Array(vec![RespValue::bulk("k"), RespValue::bulk("n")]))
        );
        assert_eq!(
            run(&mut store, &["DEL", "k", "n", "zz"]).unwrap(),
            Some(RespValue::Integer(2))
        );
    }

    #[test]
    fn test_ping_echo() {
        let mut store = Store::new();
        assert_eq!(run(&mut store, &["PING"]).unwrap(), Some(RespValue::simple("PONG")));
        assert_eq!(run(&mut store, &["PING", "hi"]).unwrap(), Some(RespValue::bulk("hi")));
        assert_eq!(run(&mut store, &["ECHO", "yo"]).unwrap(), Some(RespValue::bulk("yo")));
    }

    #[test]
    fn test_config_get() {
        let mut store = Store::new();
        let reply = run(&mut store, &["CONFIG", "GET", "dbfile*"]).unwrap();
        assert_eq!(
            reply,
            Some(RespValue::Array(vec![
                RespValue::bulk("dbfilename"),
                RespValue::bulk("dump.rdb"),
            ]))
        );
    }

    #[test]
    fn test_info_replication() {
        let mut store = Store::new();
        let reply = run(&mut store, &["INFO", "replication"]).unwrap().unwrap();
        assert!(reply.as_str().unwrap().contains("role:master"));
    }

    #[test]
    fn test_loop_commands_rejected() {
        let mut store = Store::new();
        assert!(matches!(
            run(&mut store, &["WAIT", "0", "0"]),
            Err(Error::Internal(_))
        ));
    }
}
