//! Shared data-model types: the process/account entity, the tagged
//! message-variant model that replaces reflection-based row scanning,
//! and the crypto profile table.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host OS the target process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    MacOs,
}

/// Schema generation, each with its own KDF/HMAC/reserved-area parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    V3,
    V4,
}

/// KDF/HMAC/page-layout constants for one schema generation.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub version: SchemaVersion,
    pub kdf_rounds: u32,
    pub mac_size: usize,
    /// reserved tail length = iv (16) + mac_size, rounded up to a 16-byte
    /// AES block boundary.
    pub reserved: usize,
    pub page_size: usize,
}

pub const IV_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

impl Profile {
    fn reserved_for(mac_size: usize) -> usize {
        let raw = IV_SIZE + mac_size;
        raw.div_ceil(16) * 16
    }

    pub const fn v3() -> Self {
        // reserved_for isn't const-fn friendly with div_ceil on stable msrv
        // assumptions, so the v3/v4 reserved sizes are written out directly
        // and cross-checked by a unit test against `reserved_for`.
        Profile {
            version: SchemaVersion::V3,
            kdf_rounds: 64_000,
            mac_size: 20,
            reserved: 48,
            page_size: 4096,
        }
    }

    pub const fn v4() -> Self {
        Profile {
            version: SchemaVersion::V4,
            kdf_rounds: 256_000,
            mac_size: 64,
            reserved: 80,
            page_size: 4096,
        }
    }

    pub fn for_version(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V3 => Self::v3(),
            SchemaVersion::V4 => Self::v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_matches_derivation() {
        assert_eq!(Profile::reserved_for(Profile::v3().mac_size), Profile::v3().reserved);
        assert_eq!(Profile::reserved_for(Profile::v4().mac_size), Profile::v4().reserved);
    }
}

/// A candidate process discovered by [`crate::process::enumerate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCandidate {
    pub pid: u32,
    pub executable_path: PathBuf,
    pub platform: Platform,
}

/// The process/account entity. `master_key`/`image_key` are set once
/// and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub pid: u32,
    pub executable_path: PathBuf,
    pub platform: Platform,
    pub major_version: SchemaVersion,
    pub data_dir: Option<PathBuf>,
    pub master_key: Option<[u8; KEY_SIZE]>,
    pub image_key: Option<[u8; 16]>,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Offline,
    Online,
}

impl Account {
    pub fn new(candidate: ProcessCandidate, major_version: SchemaVersion) -> Self {
        Account {
            pid: candidate.pid,
            executable_path: candidate.executable_path,
            platform: candidate.platform,
            major_version,
            data_dir: None,
            master_key: None,
            image_key: None,
            status: AccountStatus::Offline,
        }
    }

    /// Sets the master key if not already set. Returns `false` if a
    /// different key was already recorded — `master_key` is immutable
    /// once set.
    pub fn set_master_key(&mut self, key: [u8; KEY_SIZE]) -> bool {
        match self.master_key {
            None => {
                self.master_key = Some(key);
                true
            }
            Some(existing) => existing == key,
        }
    }

    pub fn set_image_key(&mut self, key: [u8; 16]) -> bool {
        match self.image_key {
            None => {
                self.image_key = Some(key);
                true
            }
            Some(existing) => existing == key,
        }
    }
}

/// One named group the DB pool opens handles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupName {
    MessageShards,
    Contacts,
    Chatrooms,
    Sessions,
    Media,
    Voice,
}

impl GroupName {
    pub fn all() -> [GroupName; 6] {
        [
            GroupName::MessageShards,
            GroupName::Contacts,
            GroupName::Chatrooms,
            GroupName::Sessions,
            GroupName::Media,
            GroupName::Voice,
        ]
    }
}

/// A single recovered message, as a tagged variant rather than a
/// reflection-scanned row of loosely-typed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MessageContent {
    Text { body: String },
    Image { content_hash: String, thumb_hash: Option<String> },
    Video { content_hash: String, duration_secs: Option<u32> },
    Voice { content_hash: String, duration_secs: Option<u32> },
    Card { title: String, display_name: String },
    Location { label: String, lat: f64, lng: f64 },
    Share { sub: String, title: String, url: Option<String> },
    Voip { duration_secs: Option<u32> },
    System { text: String },
    /// Forward-compatible fallback for kinds the schema doesn't name yet.
    Other { type_id: i64, raw: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub local_id: i64,
    pub talker: String,
    pub sender: Option<String>,
    pub create_time: i64,
    /// Raw status code; no authoritative mapping beyond "2 = sent, 4 =
    /// received" is known, so unknown values are carried through rather
    /// than interpreted.
    pub status: i64,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub user_name: String,
    pub nickname: Option<String>,
    pub remark: Option<String>,
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chatroom {
    pub user_name: String,
    pub announcement: Option<String>,
    /// Plain string keys into the contacts map, not pointers, so
    /// contacts and chatrooms don't form a reference cycle when cached.
    pub member_user_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_name: String,
    pub unread_count: Option<i64>,
    pub last_content: Option<String>,
    pub last_timestamp: Option<i64>,
}
