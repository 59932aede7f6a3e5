//! Process and node addressing.
//!
//! A process is named by three colon-separated segments,
//! `process-name:package-name:publisher`. A full [`Address`] prefixes the
//! process with the node that hosts it: `node@process:package:publisher`.
//!
//! Parsing is strict. Segments are case-sensitive, never trimmed, and must be
//! non-empty. Colons inside a segment are not supported.

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter between the segments of a process id.
pub const SEGMENT_DELIMITER: char = ':';

/// Delimiter between the node and the process id of an address.
pub const NODE_DELIMITER: char = '@';

/// Identifies a process on a node: `process:package:publisher`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessId {
    pub(crate) process_name: String,
    pub(crate) package_name: String,
    pub(crate) publisher: String,
}

impl ProcessId {
    /// Build a process id from its segments, validating each one.
    pub fn new(
        process_name: impl Into<String>,
        package_name: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let id = Self {
            process_name: process_name.into(),
            package_name: package_name.into(),
            publisher: publisher.into(),
        };
        let valid = [&id.process_name, &id.package_name, &id.publisher]
            .iter()
            .all(|s| !s.is_empty() && !s.contains(SEGMENT_DELIMITER));
        if valid {
            Ok(id)
        } else {
            Err(ParseError::MalformedAddress(id.to_string()))
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// `package:publisher`, the part shared by all processes of one package.
    pub fn package_id(&self) -> String {
        format!("{}:{}", self.package_name, self.publisher)
    }
}

/// Parse `process:package:publisher` into a [`ProcessId`].
pub fn parse_process_id(input: &str) -> Result<ProcessId, ParseError> {
    let malformed = || ParseError::MalformedAddress(input.to_string());

    let mut parts = input.split(SEGMENT_DELIMITER);
    let (Some(process), Some(package), Some(publisher), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    if process.is_empty() || package.is_empty() || publisher.is_empty() {
        return Err(malformed());
    }

    Ok(ProcessId {
        process_name: process.to_string(),
        package_name: package.to_string(),
        publisher: publisher.to_string(),
    })
}

impl FromStr for ProcessId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_process_id(s)
    }
}

impl TryFrom<String> for ProcessId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_process_id(&value)
    }
}

impl From<ProcessId> for String {
    fn from(id: ProcessId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEGMENT_DELIMITER}{}{SEGMENT_DELIMITER}{}",
            self.process_name, self.package_name, self.publisher
        )
    }
}

/// A remote endpoint: a process on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    node: String,
    process: ProcessId,
}

impl Address {
    /// Build an address from a node name and a process id.
    pub fn new(node: impl Into<String>, process: ProcessId) -> Result<Self, ParseError> {
        let node = node.into();
        if node.is_empty() || node.contains(NODE_DELIMITER) {
            return Err(ParseError::MalformedAddress(format!(
                "{node}{NODE_DELIMITER}{process}"
            )));
        }
        Ok(Self { node, process })
    }

    /// Parse `node@process:package:publisher`.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedAddress(input.to_string());

        let (node, process) = input.split_once(NODE_DELIMITER).ok_or_else(malformed)?;
        if node.is_empty() || process.contains(NODE_DELIMITER) {
            return Err(malformed());
        }
        let process = parse_process_id(process).map_err(|_| malformed())?;

        Ok(Self {
            node: node.to_string(),
            process,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn process(&self) -> &ProcessId {
        &self.process
    }

    /// The same process on a different node.
    pub fn on_node(&self, node: impl Into<String>) -> Result<Self, ParseError> {
        Self::new(node, self.process.clone())
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{NODE_DELIMITER}{}", self.node, self.process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed_process_id() {
        let id = parse_process_id("a:b:c").unwrap();
        assert_eq!(id.process_name(), "a");
        assert_eq!(id.package_name(), "b");
        assert_eq!(id.publisher(), "c");
        assert_eq!(id.to_string(), "a:b:c");
    }

    #[test]
    fn test_parse_rejects_wrong_segment_count() {
        for input in ["a:b", "a:b:c:d", "", "abc", "a:b:c:"] {
            assert_eq!(
                parse_process_id(input),
                Err(ParseError::MalformedAddress(input.to_string())),
                "input {input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_empty_segment() {
        for input in ["a::c", ":b:c", "a:b:", "::"] {
            assert!(parse_process_id(input).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_parse_is_case_sensitive_and_untrimmed() {
        let id: ProcessId = " Chat:App:Alice.os".parse().unwrap();
        assert_eq!(id.process_name(), " Chat");
        assert_eq!(id.publisher(), "Alice.os");
        assert_ne!(id, "chat:app:alice.os".parse::<ProcessId>().unwrap());
    }

    #[test]
    fn test_package_id() {
        let id: ProcessId = "chat:app:alice.os".parse().unwrap();
        assert_eq!(id.package_id(), "app:alice.os");
    }

    #[test]
    fn test_process_id_new_validates_segments() {
        assert!(ProcessId::new("chat", "app", "alice.os").is_ok());
        assert!(ProcessId::new("chat", "", "alice.os").is_err());
        assert!(ProcessId::new("ch:at", "app", "alice.os").is_err());
    }

    #[test]
    fn test_parse_full_address() {
        let addr = Address::parse("bob.os@chat:app:alice.os").unwrap();
        assert_eq!(addr.node(), "bob.os");
        assert_eq!(addr.process().to_string(), "chat:app:alice.os");
        assert_eq!(addr.to_string(), "bob.os@chat:app:alice.os");
    }

    #[test]
    fn test_parse_full_address_rejects_bad_input() {
        for input in [
            "chat:app:alice.os",
            "@chat:app:alice.os",
            "bob.os@chat:app",
            "bob.os@chat::alice.os",
            "bob@os@chat:app:alice.os",
        ] {
            assert!(Address::parse(input).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_on_node() {
        let addr = Address::parse("bob.os@chat:app:alice.os").unwrap();
        let moved = addr.on_node("carol.os").unwrap();
        assert_eq!(moved.node(), "carol.os");
        assert_eq!(moved.process(), addr.process());
        assert!(addr.on_node("").is_err());
    }

    #[test]
    fn test_address_serializes_as_string() {
        let addr = Address::parse("bob.os@chat:app:alice.os").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"bob.os@chat:app:alice.os\"");

        let err = serde_json::from_str::<Address>("\"bob.os@chat:app\"");
        assert!(err.is_err());
    }
}
