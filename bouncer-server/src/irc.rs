//! IRC message parsing and formatting.
//!
//! Implements the RFC 1459 / RFC 2812 line grammar plus IRCv3 message
//! tags. Framing (CRLF splitting) happens in the connection layer; this
//! module only deals with one line at a time.

use std::collections::HashMap;
use std::fmt;

/// A parsed IRC message with optional IRCv3 tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags (key=value pairs).
    pub tags: HashMap<String, String>,
    /// Optional message prefix (server or user origin).
    pub prefix: Option<String>,
    /// The IRC command, uppercased (e.g. "NICK", "PRIVMSG", "001").
    pub command: String,
    /// Command parameters.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line into a Message, including optional tags.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let mut rest = line;

        // Tags: @key=value;key2=value2
        let tags = if rest.starts_with('@') {
            let end = rest.find(' ')?;
            let tag_str = &rest[1..end];
            rest = rest[end + 1..].trim_start_matches(' ');
            parse_tags(tag_str)
        } else {
            HashMap::new()
        };

        let prefix = if rest.starts_with(':') {
            let end = rest.find(' ')?;
            let pfx = rest[1..end].to_string();
            rest = rest[end + 1..].trim_start_matches(' ');
            Some(pfx)
        } else {
            None
        };

        let mut params = Vec::new();
        let command;

        if let Some(space) = rest.find(' ') {
            command = rest[..space].to_ascii_uppercase();
            rest = rest[space + 1..].trim_start_matches(' ');

            while !rest.is_empty() {
                if let Some(trailing) = rest.strip_prefix(':') {
                    params.push(trailing.to_string());
                    break;
                }
                if let Some(space) = rest.find(' ') {
                    params.push(rest[..space].to_string());
                    rest = rest[space + 1..].trim_start_matches(' ');
                } else {
                    params.push(rest.to_string());
                    break;
                }
            }
        } else {
            command = rest.to_ascii_uppercase();
        }

        if command.is_empty() {
            return None;
        }

        Some(Message {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Create a new message with a server (or user hostmask) prefix.
    pub fn from_server(server: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            tags: HashMap::new(),
            prefix: Some(server.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The first parameter: the target of PRIVMSG/NOTICE/JOIN and friends,
    /// or the nickname field of a numeric reply.
    pub fn target(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }

    /// Serialize with the CRLF terminator, ready for the wire.
    pub fn to_line(&self) -> String {
        format!("{self}\r\n")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    write!(f, ";")?;
                }
                first = false;
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            tags.insert(key.to_string(), unescape_tag_value(value));
        } else {
            tags.insert(pair.to_string(), String::new());
        }
    }
    tags
}

/// Unescape IRCv3 tag values.
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Escape a value for IRCv3 tag encoding.
fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

// Errors sent by the bouncer itself
pub const ERR_NOSUCHSERVER: &str = "402";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_ALREADYREGISTRED: &str = "462";
pub const ERR_PASSWDMISMATCH: &str = "464";
