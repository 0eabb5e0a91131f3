//! Session ledger model: keys, stored values and change events

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace prefix of every ledger key
pub const SESSION_KEY_PREFIX: &str = "session";

/// Value stored while no access token has been minted for the session
const NO_ACCESS_SENTINEL: &str = "1";

const EXPIRY_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Identity of one ledger record: `session:<user_id>:<session_id>`
///
/// Both components are hyphenated UUIDs, which never contain `:`, so the
/// textual key always splits back into exactly three segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

impl SessionKey {
    pub fn new(user_id: Uuid, session_id: Uuid) -> Self {
        Self {
            user_id,
            session_id,
        }
    }

    /// Parse the key out of a keyspace notification channel name
    /// (`__keyspace@<db>__:session:<user>:<session>`)
    pub fn from_keyspace_channel(channel: &str) -> Option<Self> {
        let (_, key) = channel.split_once("__:")?;
        key.parse().ok()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            SESSION_KEY_PREFIX,
            self.user_id.as_hyphenated(),
            self.session_id.as_hyphenated()
        )
    }
}

/// Returned for strings that are not well-formed ledger keys
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed session key '{0}'")]
pub struct MalformedSessionKey(pub String);

impl FromStr for SessionKey {
    type Err = MalformedSessionKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedSessionKey(s.to_string());
        let mut parts = s.split(':');
        let (Some(prefix), Some(user), Some(session), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if prefix != SESSION_KEY_PREFIX {
            return Err(malformed());
        }
        let user_id = Uuid::try_parse(user).map_err(|_| malformed())?;
        let session_id = Uuid::try_parse(session).map_err(|_| malformed())?;
        Ok(Self::new(user_id, session_id))
    }
}

/// The access token a session currently honours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentAccess {
    pub access_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Decoded ledger value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerValue {
    /// Session created, no access token minted yet
    Pending,
    /// `<access_id>;exp:<timestamp>`
    Current(Uuid),
}

impl LedgerValue {
    /// Encode the value written for a session
    pub fn encode(current: Option<&CurrentAccess>) -> String {
        match current {
            Some(access) => format!(
                "{};exp:{}",
                access.access_id.as_hyphenated(),
                access.expires_at.format(EXPIRY_FORMAT)
            ),
            None => NO_ACCESS_SENTINEL.to_string(),
        }
    }

    /// Decode a stored value; `None` for anything unrecognisable
    pub fn decode(raw: &str) -> Option<Self> {
        if raw == NO_ACCESS_SENTINEL {
            return Some(LedgerValue::Pending);
        }
        let (id, _) = raw.split_once(";exp:")?;
        Uuid::try_parse(id).ok().map(LedgerValue::Current)
    }

    pub fn is_current(&self, access_id: Uuid) -> bool {
        matches!(self, LedgerValue::Current(id) if *id == access_id)
    }
}

/// Why a ledger record disappeared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    Expired,
    Deleted,
}

impl LedgerEventKind {
    /// Map a keyspace notification payload; other commands are not of interest
    pub fn from_notification(payload: &str) -> Option<Self> {
        match payload {
            "expired" => Some(LedgerEventKind::Expired),
            "del" | "deleted" => Some(LedgerEventKind::Deleted),
            _ => None,
        }
    }

    /// Reason sent to a realtime client disconnected because of this event
    pub fn disconnect_reason(&self) -> &'static str {
        match self {
            LedgerEventKind::Expired => "session expired",
            LedgerEventKind::Deleted => "session revoked",
        }
    }
}

/// One entry of the ledger change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEvent {
    pub key: SessionKey,
    pub kind: LedgerEventKind,
}
