use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex sha256 of `value`'s canonical JSON form.
///
/// Struct fields serialize in declaration order and maps are `BTreeMap`-backed,
/// so the same logical value always hashes to the same id.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a chat group.
    GroupId
);
string_id!(
    /// Upstream output carrying an unresolved message.
    OutputId
);
string_id!(
    /// Wallet address owning a session.
    Address
);

/// Opaque resume position in the upstream pull feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Anchor(pub String);

/// One item delivered by the upstream source, by pull or by push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawItem {
    NewMessageRef {
        output_id: OutputId,
        group_id: GroupId,
        #[serde(default)]
        payload: serde_json::Value,
    },
    MemberChanged {
        group_id: GroupId,
        address: Address,
        is_new_member: bool,
        timestamp: u64,
    },
    MarkChanged {
        group_id: GroupId,
        is_marked: bool,
    },
    MuteChanged {
        group_id: GroupId,
        address: Address,
        is_muted: bool,
    },
    LikeChanged {
        group_id: GroupId,
        address: Address,
        is_liked: bool,
    },
    MinMaxTokenUpdate {
        group_id: GroupId,
        min: Option<String>,
        max: Option<String>,
    },
    PairXChanged {
        address: Address,
    },
    DidChanged {
        address: Address,
    },
}

impl RawItem {
    /// Content-hash identity used for deduplication across pull and push.
    pub fn content_id(&self) -> Result<String, serde_json::Error> {
        content_hash(self)
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            RawItem::NewMessageRef { group_id, .. }
            | RawItem::MemberChanged { group_id, .. }
            | RawItem::MarkChanged { group_id, .. }
            | RawItem::MuteChanged { group_id, .. }
            | RawItem::LikeChanged { group_id, .. }
            | RawItem::MinMaxTokenUpdate { group_id, .. } => Some(group_id),
            RawItem::PairXChanged { .. } | RawItem::DidChanged { .. } => None,
        }
    }

    /// Control events handled by the group member domain.
    pub fn is_membership_event(&self) -> bool {
        matches!(
            self,
            RawItem::MemberChanged { .. } | RawItem::MinMaxTokenUpdate { .. }
        )
    }
}

/// A message reference waiting to be resolved into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessageRecord {
    pub output_id: OutputId,
    pub group_id: GroupId,
    pub raw_payload: serde_json::Value,
}

/// A fully resolved chat message. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub group_id: GroupId,
    pub sender: Address,
    pub message: String,
    pub timestamp: u64,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: Address,
    pub public_key: Option<String>,
}

/// Full member list of a group. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub members: Vec<GroupMember>,
}

/// Ordering-token watermark of a group, as unsigned hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMinMaxToken {
    pub group_id: GroupId,
    pub min: Option<String>,
    pub max: Option<String>,
}

/// One page returned by the upstream pull feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPage {
    pub items: Vec<RawItem>,
    pub next_cursor: Option<Anchor>,
}

/// Retry bookkeeping with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    /// Number of times this command has been retried
    pub attempt: u32,
    /// Maximum number of retry attempts allowed
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
}

impl RetryInfo {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn next_attempt(&self) -> Option<Self> {
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(Self {
                attempt: self.attempt + 1,
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
            })
        }
    }

    pub fn delay(&self) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(self.attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_changed(address: &str) -> RawItem {
        RawItem::MemberChanged {
            group_id: GroupId::from("g1"),
            address: Address::from(address),
            is_new_member: true,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_content_id_is_deterministic() {
        let a = member_changed("0x1");
        let b = member_changed("0x1");
        assert_eq!(a.content_id().unwrap(), b.content_id().unwrap());
        assert_eq!(a.content_id().unwrap().len(), 64);
    }

    #[test]
    fn test_content_id_differs_by_content() {
        assert_ne!(
            member_changed("0x1").content_id().unwrap(),
            member_changed("0x2").content_id().unwrap()
        );
    }

    #[test]
    fn test_content_id_ignores_payload_key_order() {
        let a: RawItem = serde_json::from_str(
            r#"{"type":"new_message_ref","output_id":"o1","group_id":"g1","payload":{"b":1,"a":2}}"#,
        )
        .unwrap();
        let b: RawItem = serde_json::from_str(
            r#"{"type":"new_message_ref","output_id":"o1","group_id":"g1","payload":{"a":2,"b":1}}"#,
        )
        .unwrap();
        assert_eq!(a.content_id().unwrap(), b.content_id().unwrap());
    }

    #[test]
    fn test_raw_item_tagging() {
        let json = serde_json::to_value(RawItem::PairXChanged {
            address: Address::from("0xabc"),
        })
        .unwrap();
        assert_eq!(json["type"], "pair_x_changed");
        assert_eq!(json["address"], "0xabc");
    }

    #[test]
    fn test_item_classification() {
        assert!(member_changed("0x1").is_membership_event());
        let did = RawItem::DidChanged {
            address: Address::from("0x1"),
        };
        assert_eq!(did.group_id(), None);
        assert!(!did.is_membership_event());
    }

    #[test]
    fn test_retry_info_backoff() {
        let first = RetryInfo::new(3, Duration::from_millis(100));

        let one = first.next_attempt().unwrap();
        let two = one.next_attempt().unwrap();
        let three = two.next_attempt().unwrap();
        assert_eq!(one.delay(), Duration::from_millis(100));
        assert_eq!(two.delay(), Duration::from_millis(200));
        assert_eq!(three.delay(), Duration::from_millis(400));
        assert!(three.next_attempt().is_none());
    }
}
