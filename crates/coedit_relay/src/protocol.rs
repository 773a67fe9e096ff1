//! Line protocol
//!
//! Clients send one command per line, fields separated by spaces. Edit
//! operations are relayed as one field per line. Since an edit may carry a
//! typed space, `char   5 3` is four fields: `char`, ` `, `5` and `3`. Everything the server writes
//! back is a single line from the reply vocabulary below, a session id, or
//! snapshot data supplied by a host.

use std::fmt;

/// Reply to a successful join, before the snapshot.
pub const REPLY_SUCCESS: &str = "success";
pub const REPLY_INVALID_ID: &str = "invalid id";
pub const REPLY_INVALID_PASS: &str = "invalid pass";
pub const REPLY_UNKNOWN_COMMAND: &str = "Unknown command";
pub const REPLY_LEFT: &str = "left";
pub const REPLY_PONG: &str = "pong";
pub const REPLY_CREATE_FAILED: &str = "create failed";

/// Sent to a host when a joiner needs a snapshot.
pub const SIGNAL_REQUEST: &str = "request";

/// The three edit operations clients exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditKind {
    InsertChar,
    Newline,
    Delete,
}

impl EditKind {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "char" => Some(Self::InsertChar),
            "newline" => Some(Self::Newline),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::InsertChar => "char",
            Self::Newline => "newline",
            Self::Delete => "delete",
        }
    }

    /// Number of arguments following the keyword.
    pub fn arity(&self) -> usize {
        match self {
            Self::InsertChar => 3,
            Self::Newline | Self::Delete => 2,
        }
    }
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A shape-checked edit operation.
///
/// Arguments are kept verbatim. Their meaning (row, column, character and the
/// order they appear in) is a contract between editing clients; the relay
/// only guarantees the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOp {
    kind: EditKind,
    args: Vec<String>,
}

impl EditOp {
    pub fn new(kind: EditKind, args: Vec<String>) -> Result<Self, ProtocolError> {
        if args.len() != kind.arity() {
            return Err(ProtocolError::WrongFieldCount {
                command: kind.keyword(),
                expected: kind.arity() + 1,
                got: args.len() + 1,
            });
        }
        Ok(Self { kind, args })
    }

    pub fn kind(&self) -> EditKind {
        self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Keyword followed by the arguments, in wire order.
    pub fn fields(&self) -> impl Iterator<Item = &str> + '_ {
        std::iter::once(self.kind.keyword()).chain(self.args.iter().map(String::as_str))
    }

    pub fn to_lines(&self) -> Vec<String> {
        self.fields().map(str::to_owned).collect()
    }
}

/// One parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create { password: String },
    Join { session_id: String, password: String },
    /// Host is about to send a snapshot.
    Response,
    Edit(EditOp),
    Leave,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command} expects {expected} fields, got {got}")]
    WrongFieldCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Split a line into fields.
///
/// Leading and trailing spaces are ignored. Inside the line, a run of spaces
/// is one separator, except that every pair of spaces after the first stands
/// for a literal `" "` field: three spaces between two words carry a single
/// space field.
pub fn split_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut gap = 0;
    for token in line.trim_matches(' ').split(' ') {
        if token.is_empty() {
            gap += 1;
            continue;
        }
        fields.extend(std::iter::repeat(" ").take(gap / 2));
        gap = 0;
        fields.push(token);
    }
    fields
}

fn expect_fields(command: &'static str, fields: &[&str], expected: usize) -> Result<(), ProtocolError> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::WrongFieldCount {
            command,
            expected,
            got: fields.len(),
        })
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let fields = split_fields(line);
        let Some(&keyword) = fields.first() else {
            return Err(ProtocolError::Empty);
        };

        if let Some(kind) = EditKind::from_keyword(keyword) {
            let args = fields[1..].iter().map(|f| f.to_string()).collect();
            return EditOp::new(kind, args).map(Command::Edit);
        }

        match keyword {
            "create" => {
                expect_fields("create", &fields, 2)?;
                Ok(Command::Create {
                    password: fields[1].to_string(),
                })
            }
            "join" => {
                expect_fields("join", &fields, 3)?;
                Ok(Command::Join {
                    session_id: fields[1].to_string(),
                    password: fields[2].to_string(),
                })
            }
            "response" => {
                expect_fields("response", &fields, 1)?;
                Ok(Command::Response)
            }
            "leave" => {
                expect_fields("leave", &fields, 1)?;
                Ok(Command::Leave)
            }
            "ping" => {
                expect_fields("ping", &fields, 1)?;
                Ok(Command::Ping)
            }
            other => Err(ProtocolError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_commands() {
        assert_eq!(
            Command::parse("create secret"),
            Ok(Command::Create { password: "secret".into() })
        );
        assert_eq!(
            Command::parse("join abc secret"),
            Ok(Command::Join {
                session_id: "abc".into(),
                password: "secret".into()
            })
        );
        assert_eq!(Command::parse("response"), Ok(Command::Response));
        assert_eq!(Command::parse("leave"), Ok(Command::Leave));
        assert_eq!(Command::parse("ping"), Ok(Command::Ping));
    }

    #[test]
    fn test_repeated_spaces_are_one_separator() {
        assert_eq!(
            Command::parse("  join  abc  secret "),
            Ok(Command::Join {
                session_id: "abc".into(),
                password: "secret".into()
            })
        );
    }

    #[test]
    fn test_edit_ops_require_exact_field_counts() {
        let op = match Command::parse("char 0 0 h") {
            Ok(Command::Edit(op)) => op,
            other => panic!("unexpected parse: {other:?}"),
        };
        assert_eq!(op.kind(), EditKind::InsertChar);
        assert_eq!(op.to_lines(), vec!["char", "0", "0", "h"]);

        assert!(matches!(Command::parse("newline 3 4"), Ok(Command::Edit(_))));
        assert!(matches!(Command::parse("delete 3 4"), Ok(Command::Edit(_))));

        assert_eq!(
            Command::parse("char 0 0"),
            Err(ProtocolError::WrongFieldCount {
                command: "char",
                expected: 4,
                got: 3
            })
        );
        assert!(Command::parse("newline 1 2 3").is_err());
        assert!(Command::parse("delete").is_err());
    }

    #[test]
    fn test_split_keeps_typed_spaces() {
        assert_eq!(split_fields("char   5 3"), vec!["char", " ", "5", "3"]);
        assert_eq!(split_fields("char  5 3"), vec!["char", "5", "3"]);
        assert_eq!(split_fields("a     b"), vec!["a", " ", " ", "b"]);
        assert!(split_fields("    ").is_empty());
    }

    #[test]
    fn test_typed_space_is_a_char_argument() {
        let Ok(Command::Edit(op)) = Command::parse("char   5 3") else {
            panic!("a typed space should parse as an edit");
        };
        assert_eq!(op.kind(), EditKind::InsertChar);
        assert_eq!(op.to_lines(), vec!["char", " ", "5", "3"]);
    }

    #[test]
    fn test_edit_args_are_kept_verbatim() {
        let Ok(Command::Edit(op)) = Command::parse("char x 007 -1") else {
            panic!("char with three args should parse");
        };
        assert_eq!(op.args(), ["x", "007", "-1"]);
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        assert_eq!(Command::parse(""), Err(ProtocolError::Empty));
        assert_eq!(Command::parse("   "), Err(ProtocolError::Empty));
        assert_eq!(
            Command::parse("frobnicate"),
            Err(ProtocolError::Unknown("frobnicate".into()))
        );
        assert!(Command::parse("create").is_err());
        assert!(Command::parse("create a b").is_err());
        assert!(Command::parse("join abc").is_err());
        assert!(Command::parse("response now").is_err());
    }
}
