//! The four concrete node identifier types.
//!
//! All of them are thin wrappers around their canonical string. Equality,
//! hashing and ordering are derived from that string only, so attaching a
//! display name (see [`NodeNames`](super::names::NodeNames)) never changes
//! identity.
//!
//! ```text
//! InstanceId            <instance>
//! InstanceSessionId     <instance>::<session>
//! LogicalNodeId         <instance>:<logical>
//! LogicalNodeSessionId  <instance>::<session>:<logical>
//! ```

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    IdType, NodeIdentity, DEFAULT_LOGICAL_NODE_PART, INSTANCE_PART_LENGTH,
    MAX_LOGICAL_NODE_PART_LENGTH, PART_SEPARATOR, SESSION_GENERATION_DIGITS,
    SESSION_PART_LENGTH, SESSION_SEPARATOR,
};
use crate::error::{Error, Result};

/// Highest generation that fits into the generation digits of a session part.
pub const MAX_SESSION_GENERATION: u32 = (1 << (4 * SESSION_GENERATION_DIGITS)) - 1;

// Offsets into the canonical strings; valid because every part is ASCII and
// the instance and session parts have fixed lengths.
const SESSION_START: usize = INSTANCE_PART_LENGTH + 2;
const SESSION_END: usize = SESSION_START + SESSION_PART_LENGTH;

// ================================================================================================
// Validation helpers
// ================================================================================================

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn malformed(input: &str, kind: IdType, reason: &str) -> Error {
    Error::MalformedIdentifier(format!("'{}' cannot be parsed to a valid {}: {}", input, kind, reason))
}

fn check_instance_part(input: &str, part: &str, kind: IdType) -> Result<()> {
    if part.len() != INSTANCE_PART_LENGTH || !is_lower_hex(part) {
        return Err(malformed(
            input,
            kind,
            "the instance part must be 32 lowercase hex characters",
        ));
    }
    Ok(())
}

fn check_session_part(input: &str, part: &str, kind: IdType) -> Result<()> {
    if part.len() != SESSION_PART_LENGTH || !is_lower_hex(part) {
        return Err(malformed(
            input,
            kind,
            "the session part must be 10 lowercase hex characters",
        ));
    }
    Ok(())
}

fn check_logical_part(input: &str, part: &str, kind: IdType) -> Result<()> {
    if part.len() > MAX_LOGICAL_NODE_PART_LENGTH || !is_lower_hex(part) {
        return Err(malformed(
            input,
            kind,
            "the logical node part must be 1 to 32 lowercase hex characters",
        ));
    }
    Ok(())
}

/// Numeric value of an already validated hex string.
fn hex_value(digits: &str) -> u32 {
    digits
        .chars()
        .fold(0, |acc, c| (acc << 4) | c.to_digit(16).unwrap_or(0))
}

/// Implements the string conversions shared by all id types.
macro_rules! impl_string_form {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                Self::parse(&s)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// ================================================================================================
// InstanceId
// ================================================================================================

/// Permanent identifier of an installed instance.
///
/// Minted once and persisted, so it survives restarts.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new random instance id.
    pub fn generate() -> Self {
        let value: u128 = rand::thread_rng().gen();
        InstanceId(format!("{:032x}", value))
    }

    /// Parse the canonical string form.
    pub fn parse(input: &str) -> Result<Self> {
        check_instance_part(input, input, IdType::InstanceId)?;
        Ok(InstanceId(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The default logical node hosted by this instance.
    pub fn default_logical_node_id(&self) -> LogicalNodeId {
        LogicalNodeId(format!("{}{}{}", self.0, PART_SEPARATOR, DEFAULT_LOGICAL_NODE_PART))
    }

    /// A custom logical node hosted by this instance.
    pub fn logical_node_id(&self, logical_part: &str) -> Result<LogicalNodeId> {
        let full = format!("{}{}{}", self.0, PART_SEPARATOR, logical_part);
        check_logical_part(&full, logical_part, IdType::LogicalNodeId)?;
        Ok(LogicalNodeId(full))
    }
}

impl_string_form!(InstanceId);

// ================================================================================================
// InstanceSessionId
// ================================================================================================

/// Result of comparing two sessions of the same instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Freshness {
    /// `self` was generated after `other`.
    Newer,
    /// Both refer to the same session.
    Same,
    /// `self` was generated before `other`.
    Older,
    /// Neither can be ordered before the other: same generation with different
    /// suffixes, or sessions of two different instances.
    Conflicting,
}

/// An [`InstanceId`] plus the session part minted at process start.
///
/// The session part is `<generation:6 hex><random:4 hex>`. Generations grow by
/// one on every start of the instance, which gives sessions of the same
/// instance a total order that does not depend on wall-clock time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceSessionId(String);

impl InstanceSessionId {
    /// Derive a session of `instance` with the given generation and a random suffix.
    pub fn new(instance: &InstanceId, generation: u32) -> Result<Self> {
        if generation > MAX_SESSION_GENERATION {
            return Err(Error::MalformedIdentifier(format!(
                "session generation {} exceeds the maximum of {}",
                generation, MAX_SESSION_GENERATION
            )));
        }
        let suffix: u16 = rand::thread_rng().gen();
        Ok(InstanceSessionId(format!(
            "{}{}{:06x}{:04x}",
            instance.as_str(),
            SESSION_SEPARATOR,
            generation,
            suffix
        )))
    }

    /// Parse the canonical string form.
    pub fn parse(input: &str) -> Result<Self> {
        let kind = IdType::InstanceSessionId;
        let (instance, session) = input
            .split_once(SESSION_SEPARATOR)
            .ok_or_else(|| malformed(input, kind, "missing '::' separator"))?;
        check_instance_part(input, instance, kind)?;
        check_session_part(input, session, kind)?;
        Ok(InstanceSessionId(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instance_part(&self) -> &str {
        &self.0[..INSTANCE_PART_LENGTH]
    }

    pub fn session_part(&self) -> &str {
        &self.0[SESSION_START..SESSION_END]
    }

    /// Generation encoded in the session part.
    pub fn generation(&self) -> u32 {
        hex_value(&self.session_part()[..SESSION_GENERATION_DIGITS])
    }

    /// The session that follows this one (next process start).
    pub fn next_session(&self) -> Result<Self> {
        InstanceSessionId::new(&self.instance_id(), self.generation() + 1)
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.instance_part().to_owned())
    }

    pub fn default_logical_node_id(&self) -> LogicalNodeId {
        self.instance_id().default_logical_node_id()
    }

    pub fn default_logical_node_session_id(&self) -> LogicalNodeSessionId {
        LogicalNodeSessionId(format!(
            "{}{}{}",
            self.0, PART_SEPARATOR, DEFAULT_LOGICAL_NODE_PART
        ))
    }

    /// Compare the session generation of `self` against `other`.
    pub fn freshness_against(&self, other: &InstanceSessionId) -> Freshness {
        if self.instance_part() != other.instance_part() {
            return Freshness::Conflicting;
        }
        if self.session_part() == other.session_part() {
            return Freshness::Same;
        }
        match self.generation().cmp(&other.generation()) {
            std::cmp::Ordering::Greater => Freshness::Newer,
            std::cmp::Ordering::Less => Freshness::Older,
            std::cmp::Ordering::Equal => Freshness::Conflicting,
        }
    }

    pub fn is_newer_than(&self, other: &InstanceSessionId) -> bool {
        self.freshness_against(other) == Freshness::Newer
    }
}

impl_string_form!(InstanceSessionId);

// ================================================================================================
// LogicalNodeId
// ================================================================================================

/// An addressable logical endpoint of an instance, not bound to a session.
///
/// Unbound ids cannot be used to open a channel; bind them to the current
/// session with [`LogicalNodeId::bind`] first.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalNodeId(String);

impl LogicalNodeId {
    pub fn parse(input: &str) -> Result<Self> {
        let kind = IdType::LogicalNodeId;
        let (instance, logical) = input
            .split_once(PART_SEPARATOR)
            .ok_or_else(|| malformed(input, kind, "missing ':' separator"))?;
        check_instance_part(input, instance, kind)?;
        check_logical_part(input, logical, kind)?;
        Ok(LogicalNodeId(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instance_part(&self) -> &str {
        &self.0[..INSTANCE_PART_LENGTH]
    }

    pub fn logical_node_part(&self) -> &str {
        &self.0[INSTANCE_PART_LENGTH + 1..]
    }

    pub fn is_default(&self) -> bool {
        self.logical_node_part() == DEFAULT_LOGICAL_NODE_PART
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.instance_part().to_owned())
    }

    /// Attach a session of the same instance.
    pub fn bind(&self, session: &InstanceSessionId) -> Result<LogicalNodeSessionId> {
        if self.instance_part() != session.instance_part() {
            return Err(Error::InvalidConversion {
                from: IdType::LogicalNodeId.name(),
                to: IdType::LogicalNodeSessionId.name(),
                reason: format!(
                    "{} and {} refer to different instances",
                    self, session
                ),
            });
        }
        Ok(LogicalNodeSessionId(format!(
            "{}{}{}",
            session.as_str(),
            PART_SEPARATOR,
            self.logical_node_part()
        )))
    }
}

impl_string_form!(LogicalNodeId);

// ================================================================================================
// LogicalNodeSessionId
// ================================================================================================

/// A logical node bound to one session of its instance; the addressable form
/// used as RPC target and caller.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalNodeSessionId(String);

impl LogicalNodeSessionId {
    pub fn parse(input: &str) -> Result<Self> {
        let kind = IdType::LogicalNodeSessionId;
        let (instance, rest) = input
            .split_once(SESSION_SEPARATOR)
            .ok_or_else(|| malformed(input, kind, "missing '::' separator"))?;
        let (session, logical) = rest
            .split_once(PART_SEPARATOR)
            .ok_or_else(|| malformed(input, kind, "missing logical node part"))?;
        check_instance_part(input, instance, kind)?;
        check_session_part(input, session, kind)?;
        check_logical_part(input, logical, kind)?;
        Ok(LogicalNodeSessionId(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instance_part(&self) -> &str {
        &self.0[..INSTANCE_PART_LENGTH]
    }

    pub fn session_part(&self) -> &str {
        &self.0[SESSION_START..SESSION_END]
    }

    pub fn logical_node_part(&self) -> &str {
        &self.0[SESSION_END + 1..]
    }

    pub fn is_default(&self) -> bool {
        self.logical_node_part() == DEFAULT_LOGICAL_NODE_PART
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.instance_part().to_owned())
    }

    /// Strip the logical node part.
    pub fn instance_session_id(&self) -> InstanceSessionId {
        InstanceSessionId(self.0[..SESSION_END].to_owned())
    }

    /// Strip the session part.
    pub fn logical_node_id(&self) -> LogicalNodeId {
        LogicalNodeId(format!(
            "{}{}{}",
            self.instance_part(),
            PART_SEPARATOR,
            self.logical_node_part()
        ))
    }
}

impl_string_form!(LogicalNodeSessionId);

// ================================================================================================
// NodeIdentity impls
// ================================================================================================

impl NodeIdentity for InstanceId {
    fn id_type(&self) -> IdType {
        IdType::InstanceId
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn instance_part(&self) -> &str {
        &self.0
    }

    fn name_key(&self) -> &str {
        &self.0
    }
}

impl NodeIdentity for InstanceSessionId {
    fn id_type(&self) -> IdType {
        IdType::InstanceSessionId
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn instance_part(&self) -> &str {
        InstanceSessionId::instance_part(self)
    }

    fn name_key(&self) -> &str {
        &self.0
    }
}

impl NodeIdentity for LogicalNodeId {
    fn id_type(&self) -> IdType {
        IdType::LogicalNodeId
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn instance_part(&self) -> &str {
        LogicalNodeId::instance_part(self)
    }

    fn name_key(&self) -> &str {
        LogicalNodeId::instance_part(self)
    }

    fn logical_node_part(&self) -> Option<&str> {
        Some(LogicalNodeId::logical_node_part(self))
    }
}

impl NodeIdentity for LogicalNodeSessionId {
    fn id_type(&self) -> IdType {
        IdType::LogicalNodeSessionId
    }

    fn as_str(&self) -> &str {
        &self.0
    }

    fn instance_part(&self) -> &str {
        LogicalNodeSessionId::instance_part(self)
    }

    // the "<instance>::<session>" prefix doubles as the session's name key
    fn name_key(&self) -> &str {
        &self.0[..SESSION_END]
    }

    fn logical_node_part(&self) -> Option<&str> {
        Some(LogicalNodeSessionId::logical_node_part(self))
    }
}
