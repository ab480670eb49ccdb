//! Command classification.
//!
//! Converts an array-of-bulk-strings frame into a [`Command`] with a
//! canonical name, then answers the two questions the proxy needs:
//! which keys does this command touch, and is it a write. Both come
//! from a static table mapping canonical names to a key extractor and
//! a category list.
//!
//! Unknown names and arity violations are deliberately non-fatal
//! errors: the proxy forwards such commands untouched and only skips
//! key handling for them.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Message;

/// Command families whose canonical name is `"FAMILY SUBOP"`, taken
/// from the first two array elements.
const SUB_OP_FAMILIES: [&str; 8] = [
    "BITOP", "FUNCTION", "SCRIPT", "CLIENT", "CLUSTER", "ACL", "COMMAND", "CONFIG",
];

/// How a command's keys are located in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExtractor {
    /// The command touches no keys.
    None,
    /// The first argument is the only key.
    First,
    /// Every argument is a key (MGET, UNLINK).
    All,
    /// Keys and values alternate; the keys sit at the odd positions of
    /// the full command array, i.e. arguments 0, 2, 4, … (MSET).
    /// Fails when the arguments don't pair up.
    Odd,
    /// The first two arguments are keys (LCS).
    FirstTwo,
}

/// Behavioural categories, mirroring the upstream's command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Connection,
    Dangerous,
    Fast,
    Keyspace,
    Read,
    SetOp,
    Slow,
    SortedSet,
    StringOp,
    Write,
}

/// A command table entry: where the keys are and how the command
/// behaves.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub keys: KeyExtractor,
    pub categories: &'static [Category],
}

/// Looks up the table entry for a canonical command name.
///
/// Two-word sub-op names fall back to their family entry, so
/// `CONFIG GET` resolves through `CONFIG`. Extending the table is an
/// additive change.
pub fn spec_for(name: &str) -> Option<CommandSpec> {
    lookup(name).or_else(|| {
        let (family, _) = name.split_once(' ')?;
        if SUB_OP_FAMILIES.contains(&family) {
            lookup(family)
        } else {
            None
        }
    })
}

fn lookup(name: &str) -> Option<CommandSpec> {
    use Category::*;
    use KeyExtractor as K;

    let entry = |keys: KeyExtractor, categories: &'static [Category]| CommandSpec {
        keys,
        categories,
    };

    Some(match name {
        // connection
        "SELECT" => entry(K::None, &[Fast, Connection]),
        "PING" => entry(K::None, &[Fast, Connection]),

        // keyspace
        "UNLINK" => entry(K::All, &[Keyspace, Write, Fast]),
        "FLUSHALL" => entry(K::None, &[Keyspace, Write, Slow, Dangerous]),
        "FLUSHDB" => entry(K::None, &[Keyspace, Write, Slow, Dangerous]),

        // server-side families, all key-less
        "FUNCTION" | "CLIENT" | "CLUSTER" | "ACL" | "COMMAND" | "CONFIG" => {
            entry(K::None, &[Slow])
        }

        // strings
        "APPEND" => entry(K::First, &[Write, StringOp, Fast]),
        "DECR" => entry(K::First, &[Write, StringOp, Fast]),
        "DECRBY" => entry(K::First, &[Write, StringOp, Fast]),
        "GET" => entry(K::First, &[Read, StringOp, Fast]),
        "GETDEL" => entry(K::First, &[Write, StringOp, Fast]),
        "GETEX" => entry(K::First, &[Write, StringOp, Fast]),
        "GETRANGE" => entry(K::First, &[Read, StringOp, Slow]),
        "GETSET" => entry(K::First, &[Write, StringOp, Fast]),
        "INCR" => entry(K::First, &[Write, StringOp, Fast]),
        "INCRBY" => entry(K::First, &[Write, StringOp, Fast]),
        "INCRBYFLOAT" => entry(K::First, &[Write, StringOp, Fast]),
        "LCS" => entry(K::FirstTwo, &[Read, StringOp, Slow]),
        "MGET" => entry(K::All, &[Read, StringOp, Fast]),
        "MSET" => entry(K::Odd, &[Write, StringOp, Fast]),
        "MSETNX" => entry(K::Odd, &[Write, StringOp, Fast]),
        "SET" => entry(K::First, &[Write, StringOp, Fast]),
        "SETRANGE" => entry(K::First, &[Write, StringOp, Fast]),
        "STRLEN" => entry(K::First, &[Read, StringOp, Fast]),

        // sets
        "SADD" => entry(K::First, &[Write, SetOp, Fast]),
        "SREM" => entry(K::First, &[Write, SetOp, Fast]),

        // sorted sets
        "ZADD" => entry(K::First, &[Write, SortedSet, Fast]),

        _ => return None,
    })
}

/// A client command lifted out of an array frame.
///
/// `name` is canonical (uppercased, with the sub-op joined in for the
/// families that use one); `args` are the raw bulk payloads after the
/// name.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl Command {
    /// Lifts a command out of `msg`.
    ///
    /// The frame must be a non-empty array whose elements are all bulk
    /// strings; anything else is [`ProtocolError::InvalidCommand`],
    /// which a session answers with a RESP error.
    pub fn from_message(msg: &Message) -> Result<Command, ProtocolError> {
        let items = match msg {
            Message::Array(items) => items,
            other => {
                return Err(ProtocolError::InvalidCommand(format!(
                    "expected an array frame, got {:?}",
                    other.kind()
                )));
            }
        };
        if items.is_empty() {
            return Err(ProtocolError::InvalidCommand("empty command array".into()));
        }

        let mut words = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item {
                Message::Bulk(data) => words.push(data.clone()),
                other => {
                    return Err(ProtocolError::InvalidCommand(format!(
                        "element {i} is {:?}, expected a bulk string",
                        other.kind()
                    )));
                }
            }
        }

        let mut name = bulk_to_upper(&words[0]).ok_or_else(|| {
            ProtocolError::InvalidCommand("command name is not valid utf-8".into())
        })?;
        if name.is_empty() {
            return Err(ProtocolError::InvalidCommand(
                "empty command name".into(),
            ));
        }

        // PING is key-less with at most one argument and never a sub-op
        if name == "PING" && words.len() > 2 {
            return Err(ProtocolError::InvalidCommand(
                "PING takes at most one argument".into(),
            ));
        }

        let first_arg = if SUB_OP_FAMILIES.contains(&name.as_str()) && words.len() >= 2 {
            let sub_op = bulk_to_upper(&words[1]).ok_or_else(|| {
                ProtocolError::InvalidCommand("sub-op name is not valid utf-8".into())
            })?;
            name.push(' ');
            name.push_str(&sub_op);
            2
        } else {
            1
        };

        Ok(Command {
            name,
            args: words.split_off(first_arg),
        })
    }

    /// The keys this command touches, in argument order.
    ///
    /// `UnknownCommand` when the table has no entry for the name,
    /// `UnsupportedArity` when the extractor's shape requirement is
    /// violated. Neither terminates a session.
    pub fn keys(&self) -> Result<Vec<String>, ProtocolError> {
        let spec =
            spec_for(&self.name).ok_or_else(|| ProtocolError::UnknownCommand(self.name.clone()))?;

        let keys: Vec<String> = match spec.keys {
            KeyExtractor::None => Vec::new(),
            KeyExtractor::First => {
                if self.args.is_empty() {
                    return Err(ProtocolError::UnsupportedArity(self.name.clone()));
                }
                vec![key_text(&self.args[0])]
            }
            KeyExtractor::All => self.args.iter().map(|a| key_text(a)).collect(),
            KeyExtractor::Odd => {
                if self.args.is_empty() || self.args.len() % 2 != 0 {
                    return Err(ProtocolError::UnsupportedArity(self.name.clone()));
                }
                self.args.iter().step_by(2).map(|a| key_text(a)).collect()
            }
            KeyExtractor::FirstTwo => {
                if self.args.len() < 2 {
                    return Err(ProtocolError::UnsupportedArity(self.name.clone()));
                }
                self.args[..2].iter().map(|a| key_text(a)).collect()
            }
        };

        Ok(keys)
    }

    /// True iff the table marks this command with the write category.
    /// Unknown commands are treated as reads.
    pub fn is_write(&self) -> bool {
        spec_for(&self.name)
            .map(|spec| spec.categories.contains(&Category::Write))
            .unwrap_or(false)
    }

    /// Argument at `idx` decoded as text, if present.
    pub fn arg_text(&self, idx: usize) -> Option<String> {
        self.args.get(idx).map(|a| key_text(a))
    }
}

fn bulk_to_upper(data: &Bytes) -> Option<String> {
    std::str::from_utf8(data)
        .ok()
        .map(|s| s.to_ascii_uppercase())
}

/// Keys travel into the lock table as text; non-UTF-8 bytes are
/// replaced rather than rejected, matching how the upstream treats
/// binary keys as opaque.
fn key_text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: build an array frame from bulk strings.
    fn cmd(parts: &[&str]) -> Message {
        Message::command(parts.iter().copied())
    }

    fn classify(parts: &[&str]) -> Command {
        Command::from_message(&cmd(parts)).expect("well-formed command")
    }

    #[test]
    fn name_is_uppercased() {
        assert_eq!(classify(&["get", "k"]).name, "GET");
        assert_eq!(classify(&["SeT", "k", "v"]).name, "SET");
    }

    #[test]
    fn args_follow_the_name() {
        let c = classify(&["SET", "k", "v"]);
        assert_eq!(c.args.len(), 2);
        assert_eq!(c.arg_text(0).as_deref(), Some("k"));
        assert_eq!(c.arg_text(1).as_deref(), Some("v"));
    }

    #[test]
    fn sub_op_joins_two_words() {
        let c = classify(&["config", "get", "maxmemory"]);
        assert_eq!(c.name, "CONFIG GET");
        assert_eq!(c.args.len(), 1);

        let c = classify(&["CLIENT", "SETNAME", "anarcho"]);
        assert_eq!(c.name, "CLIENT SETNAME");
    }

    #[test]
    fn sub_op_family_alone_keeps_one_word() {
        let c = classify(&["COMMAND"]);
        assert_eq!(c.name, "COMMAND");
        assert_eq!(c.keys().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn ping_is_not_a_sub_op() {
        let c = classify(&["PING", "hello"]);
        assert_eq!(c.name, "PING");
        assert!(c.keys().unwrap().is_empty());
        assert!(!c.is_write());
    }

    #[test]
    fn ping_arity_capped() {
        let err = Command::from_message(&cmd(&["PING", "a", "b"])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
    }

    #[test]
    fn first_extractor() {
        assert_eq!(classify(&["GET", "k"]).keys().unwrap(), vec!["k"]);
        assert_eq!(classify(&["SET", "k", "v"]).keys().unwrap(), vec!["k"]);

        let err = classify(&["GET"]).keys().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedArity(_)));
    }

    #[test]
    fn all_extractor() {
        assert_eq!(
            classify(&["MGET", "a", "b", "c"]).keys().unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            classify(&["UNLINK", "x", "y"]).keys().unwrap(),
            vec!["x", "y"]
        );
    }

    #[test]
    fn odd_extractor_takes_pair_heads() {
        assert_eq!(
            classify(&["MSET", "a", "1", "b", "2"]).keys().unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            classify(&["MSETNX", "k", "v"]).keys().unwrap(),
            vec!["k"]
        );
    }

    #[test]
    fn odd_extractor_rejects_dangling_value() {
        let err = classify(&["MSET", "a", "1", "b"]).keys().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedArity(_)));

        let err = classify(&["MSET"]).keys().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedArity(_)));
    }

    #[test]
    fn first_two_extractor() {
        assert_eq!(
            classify(&["LCS", "k1", "k2"]).keys().unwrap(),
            vec!["k1", "k2"]
        );
        assert_eq!(
            classify(&["LCS", "k1", "k2", "LEN"]).keys().unwrap(),
            vec!["k1", "k2"]
        );

        let err = classify(&["LCS", "k1"]).keys().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedArity(_)));
    }

    #[test]
    fn key_less_commands() {
        for name in ["SELECT", "FLUSHALL", "FLUSHDB", "PING"] {
            let c = classify(&[name, "0"]);
            assert!(c.keys().unwrap().is_empty(), "{name} should be key-less");
        }
    }

    #[test]
    fn write_classification() {
        for name in ["SET", "APPEND", "INCR", "MSET", "SADD", "ZADD", "UNLINK"] {
            let c = classify(&[name, "x", "a", "b"]);
            assert!(c.is_write(), "{name} should be a write");
        }
        for name in ["GET", "MGET", "STRLEN", "LCS", "SELECT", "PING"] {
            let c = classify(&[name, "a", "b"]);
            assert!(!c.is_write(), "{name} should not be a write");
        }
    }

    #[test]
    fn unknown_command() {
        let c = classify(&["HELLO"]);
        let err = c.keys().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(name) if name == "HELLO"));
        assert!(!c.is_write());
    }

    #[test]
    fn non_array_rejected() {
        let err = Command::from_message(&Message::Simple("PING".into())).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
    }

    #[test]
    fn empty_array_rejected() {
        let err = Command::from_message(&Message::Array(vec![])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
    }

    #[test]
    fn non_bulk_element_rejected() {
        let msg = Message::Array(vec![Message::Integer(1)]);
        let err = Command::from_message(&msg).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
    }

    #[test]
    fn every_table_entry_handles_every_arity() {
        // key extraction either succeeds or reports arity, never panics
        let names = [
            "SELECT", "UNLINK", "FLUSHALL", "FLUSHDB", "APPEND", "DECR", "DECRBY", "GET",
            "GETDEL", "GETEX", "GETRANGE", "GETSET", "INCR", "INCRBY", "INCRBYFLOAT", "LCS",
            "MGET", "MSET", "MSETNX", "SET", "SETRANGE", "STRLEN", "SADD", "SREM", "ZADD",
        ];
        let filler = ["a", "b", "c", "d", "e"];

        for name in names {
            for argc in 0..=filler.len() {
                let mut parts = vec![name];
                parts.extend_from_slice(&filler[..argc]);
                let c = classify(&parts);
                match c.keys() {
                    Ok(_) => {}
                    Err(ProtocolError::UnsupportedArity(n)) => assert_eq!(n, name),
                    Err(other) => panic!("{name}/{argc}: unexpected error {other:?}"),
                }
            }
        }
    }
}
