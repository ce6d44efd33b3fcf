//! Script Manager Module
//!
//! Loads the cache's server-side Lua scripts onto the coordinator once per
//! connection, memoizes their SHA-1 identifiers, and dispatches EVALSHA
//! invocations by name. If the coordinator's script cache is flushed (server
//! restart, `SCRIPT FLUSH`), a dispatch fails with NOSCRIPT; the manager
//! reloads the recorded body once and retries exactly once before
//! propagating the failure.

use std::collections::HashMap;

use redis::{Connection, ErrorKind, Value};
use tracing::debug;

use crate::error::{CacheError, Result};

struct ScriptEntry {
    body: String,
    sha: String,
}

// == Script Manager ==
/// Registry of named server-side scripts for one coordinator connection.
///
/// The manager does not own the connection; every operation borrows it.
/// This keeps a single `redis::Connection` shareable between the manager
/// and the rest of the cache handle without interior mutability.
pub struct ScriptManager {
    entries: HashMap<String, ScriptEntry>,
}

impl ScriptManager {
    /// Creates an empty script registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    // == Register and Load ==
    /// Sends the script body with `SCRIPT LOAD`, records the returned SHA-1
    /// under `name`, and returns it. Re-registering a name reloads and
    /// overwrites; the operation is idempotent per manager.
    pub fn register_and_load(
        &mut self,
        conn: &mut Connection,
        name: &str,
        body: &str,
    ) -> Result<String> {
        let sha = script_load(conn, body)?;
        debug!(script = name, sha = %sha, "loaded coordinator script");
        self.entries.insert(
            name.to_string(),
            ScriptEntry {
                body: body.to_string(),
                sha: sha.clone(),
            },
        );
        Ok(sha)
    }

    /// Returns the memoized SHA-1 for a registered script name.
    pub fn sha(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|entry| entry.sha.as_str())
    }

    // == EVALSHA to Integer ==
    /// Invokes the named script and coerces the reply to an `i64`.
    ///
    /// Accepted reply shapes: integer, boolean, status (`OK` and friends
    /// count as 1), nil (counts as 0), and numeric bulk strings. Any other
    /// shape is an `UnexpectedReply` error.
    ///
    /// On NOSCRIPT the script body is reloaded and the invocation retried
    /// once; any further failure propagates.
    pub fn evalsha_int(
        &mut self,
        conn: &mut Connection,
        name: &str,
        keys: &[&str],
        argv: &[&str],
    ) -> Result<i64> {
        let (sha, body) = {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| CacheError::UnknownScript(name.to_string()))?;
            (entry.sha.clone(), entry.body.clone())
        };

        match evalsha_raw(conn, &sha, keys, argv) {
            Ok(value) => reply_to_int(value),
            Err(err) if err.kind() == ErrorKind::NoScriptError => {
                // Script cache was flushed out from under us; reload and retry once.
                debug!(script = name, "NOSCRIPT from coordinator, reloading");
                let sha = script_load(conn, &body)?;
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.sha = sha.clone();
                }
                reply_to_int(evalsha_raw(conn, &sha, keys, argv)?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for ScriptManager {
    fn default() -> Self {
        Self::new()
    }
}

fn script_load(conn: &mut Connection, body: &str) -> Result<String> {
    let sha: String = redis::cmd("SCRIPT").arg("LOAD").arg(body).query(conn)?;
    Ok(sha)
}

fn evalsha_raw(
    conn: &mut Connection,
    sha: &str,
    keys: &[&str],
    argv: &[&str],
) -> redis::RedisResult<Value> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(sha).arg(keys.len());
    for key in keys {
        cmd.arg(*key);
    }
    for arg in argv {
        cmd.arg(*arg);
    }
    cmd.query(conn)
}

// == Reply Normalization ==
/// Coerces a script reply to an integer across protocol versions.
fn reply_to_int(value: Value) -> Result<i64> {
    match value {
        Value::Int(n) => Ok(n),
        Value::Boolean(b) => Ok(i64::from(b)),
        Value::Okay => Ok(1),
        Value::SimpleString(_) => Ok(1),
        Value::Nil => Ok(0),
        Value::BulkString(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            text.parse().map_err(|_| {
                CacheError::UnexpectedReply(format!("non-numeric string reply: {text:?}"))
            })
        }
        other => Err(CacheError::UnexpectedReply(format!(
            "integer expected, got {other:?}"
        ))),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_to_int_integer() {
        assert_eq!(reply_to_int(Value::Int(42)).unwrap(), 42);
        assert_eq!(reply_to_int(Value::Int(-1)).unwrap(), -1);
    }

    #[test]
    fn test_reply_to_int_status_ok() {
        assert_eq!(reply_to_int(Value::Okay).unwrap(), 1);
        assert_eq!(
            reply_to_int(Value::SimpleString("QUEUED".to_string())).unwrap(),
            1
        );
    }

    #[test]
    fn test_reply_to_int_nil() {
        assert_eq!(reply_to_int(Value::Nil).unwrap(), 0);
    }

    #[test]
    fn test_reply_to_int_boolean() {
        assert_eq!(reply_to_int(Value::Boolean(true)).unwrap(), 1);
        assert_eq!(reply_to_int(Value::Boolean(false)).unwrap(), 0);
    }

    #[test]
    fn test_reply_to_int_numeric_string() {
        assert_eq!(reply_to_int(Value::BulkString(b"123".to_vec())).unwrap(), 123);
        assert_eq!(reply_to_int(Value::BulkString(b"-7".to_vec())).unwrap(), -7);
    }

    #[test]
    fn test_reply_to_int_rejects_garbage_string() {
        let result = reply_to_int(Value::BulkString(b"not a number".to_vec()));
        assert!(matches!(result, Err(CacheError::UnexpectedReply(_))));
    }

    #[test]
    fn test_reply_to_int_rejects_arrays() {
        let result = reply_to_int(Value::Array(vec![Value::Int(1)]));
        assert!(matches!(result, Err(CacheError::UnexpectedReply(_))));
    }

    #[test]
    fn test_unknown_script_name_is_reported() {
        let manager = ScriptManager::new();
        assert!(manager.sha("never-registered").is_none());
    }
}
