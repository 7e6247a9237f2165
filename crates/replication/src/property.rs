//! Node property records and their compact wire form.
//!
//! A record is written as
//!
//! ```text
//! <instance>::<session>:<key>:<sequence>:<value>
//! ```
//!
//! The owner part has a fixed length, the key must not contain `:`, and the
//! value is everything after the fourth separator, so values may contain
//! `:` themselves. An empty value is a tombstone.

use std::fmt;

use corelib::node::{INSTANCE_PART_LENGTH, SESSION_PART_LENGTH};
use corelib::{InstanceId, InstanceSessionId};

use crate::error::{ReplicationError, Result};

const OWNER_LENGTH: usize = INSTANCE_PART_LENGTH + 2 + SESSION_PART_LENGTH;

/// Well-known key: the human-readable name of the publishing node.
pub const KEY_DISPLAY_NAME: &str = "displayName";

/// One published key/value pair of a node session.
///
/// `value == None` is a tombstone: the key was deliberately removed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeProperty {
    owner: InstanceSessionId,
    key: String,
    sequence: u64,
    value: Option<String>,
}

/// Check that `key` can be carried in the compact form.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(':') {
        return Err(ReplicationError::MalformedRecord(format!(
            "invalid property key '{}': keys must be non-empty and must not contain ':'",
            key
        )));
    }
    Ok(())
}

impl NodeProperty {
    /// Create a record; an empty `value` is normalized to a tombstone.
    pub fn new(
        owner: InstanceSessionId,
        key: impl Into<String>,
        sequence: u64,
        value: Option<String>,
    ) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self {
            owner,
            key,
            sequence,
            value: value.filter(|v| !v.is_empty()),
        })
    }

    /// Create a tombstone for `key`.
    pub fn tombstone(owner: InstanceSessionId, key: impl Into<String>, sequence: u64) -> Result<Self> {
        Self::new(owner, key, sequence, None)
    }

    pub fn owner(&self) -> &InstanceSessionId {
        &self.owner
    }

    pub fn instance_id(&self) -> InstanceId {
        self.owner.instance_id()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Encode to the compact form.
    pub fn to_compact_form(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.owner,
            self.key,
            self.sequence,
            self.value.as_deref().unwrap_or_default()
        )
    }

    /// Decode the compact form.
    pub fn parse_compact_form(input: &str) -> Result<Self> {
        let malformed = |reason: &str| ReplicationError::MalformedRecord(format!("'{}': {}", input, reason));

        let owner = input
            .get(..OWNER_LENGTH)
            .ok_or_else(|| malformed("too short"))?;
        let rest = input[OWNER_LENGTH..]
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing separator after the owner id"))?;
        let owner = InstanceSessionId::parse(owner).map_err(|_| malformed("invalid owner id"))?;

        let mut parts = rest.splitn(3, ':');
        let key = parts.next().unwrap_or_default();
        let sequence = parts
            .next()
            .ok_or_else(|| malformed("missing sequence number"))?
            .parse::<u64>()
            .map_err(|_| malformed("invalid sequence number"))?;
        let value = parts.next().ok_or_else(|| malformed("missing value"))?;

        Self::new(owner, key, sequence, Some(value.to_owned()))
    }
}

impl fmt::Display for NodeProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_compact_form())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> InstanceSessionId {
        InstanceSessionId::new(&InstanceId::generate(), 7).unwrap()
    }

    #[test]
    fn test_compact_form() {
        let owner = owner();
        let property = NodeProperty::new(owner.clone(), "k1", 100, Some("v1".into())).unwrap();
        let compact = property.to_compact_form();
        assert_eq!(compact, format!("{}:k1:100:v1", owner));
        assert_eq!(NodeProperty::parse_compact_form(&compact).unwrap(), property);
    }

    #[test]
    fn test_values_may_contain_separators() {
        let owner = owner();
        let input = format!("{}:endpoint:3:tcp:127.0.0.1:21000", owner);
        let property = NodeProperty::parse_compact_form(&input).unwrap();
        assert_eq!(property.key(), "endpoint");
        assert_eq!(property.value(), Some("tcp:127.0.0.1:21000"));
    }

    #[test]
    fn test_empty_value_is_tombstone() {
        let owner = owner();
        let property = NodeProperty::parse_compact_form(&format!("{}:k1:5:", owner)).unwrap();
        assert!(property.is_tombstone());
        assert_eq!(property.to_compact_form(), format!("{}:k1:5:", owner));

        let explicit = NodeProperty::new(owner, "k1", 5, Some(String::new())).unwrap();
        assert!(explicit.is_tombstone());
    }

    #[test]
    fn test_rejects_malformed_records() {
        let owner = owner();
        let cases = [
            String::new(),
            "short".to_owned(),
            format!("{}k1:1:v", owner),
            format!("{}::1:v", owner),
            format!("{}:k1:x:v", owner),
            format!("{}:k1:-1:v", owner),
            format!("{}:k1:1", owner),
            format!("{}:k1", owner),
            "0123456789abcdef0123456789abcdef::zzzzzzzzzz:k:1:v".to_owned(),
        ];
        for input in cases {
            assert!(
                matches!(
                    NodeProperty::parse_compact_form(&input),
                    Err(ReplicationError::MalformedRecord(_))
                ),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(NodeProperty::new(owner(), "", 1, None).is_err());
        assert!(NodeProperty::new(owner(), "a:b", 1, None).is_err());
        assert!(NodeProperty::new(owner(), KEY_DISPLAY_NAME, 1, Some("n".into())).is_ok());
    }
}
