//! Blob key naming and validation.
//!
//! A [`BlobKey`] is a two-part identifier `(folder, name)` mapping to one
//! remote object path. The remote layout mirrors the key scheme:
//!
//! - `{scope}/info/guild_info.json` and friends for singleton records
//! - `{scope}/permissions/{kind}_permissions.json` for permission maps
//! - `{scope}/messages/{channel_id}/{member|bot}_messages.json` for ledgers
//! - `{scope}/messages/{channel_id}/metadata.json` for per-channel cursors

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::content::BlobKind;
use crate::error::{Result, TypeError};

/// Characters that are forbidden anywhere in a key segment.
const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '\n', '\r', '\\', '?', '#', '%'];

/// Which of a channel's two message ledgers a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamClass {
    /// Messages authored by guild members.
    Member,
    /// Messages authored by bots.
    Bot,
}

impl StreamClass {
    /// The ledger blob name for this class (`member_messages` / `bot_messages`).
    pub fn blob_name(&self) -> &'static str {
        match self {
            StreamClass::Member => "member_messages",
            StreamClass::Bot => "bot_messages",
        }
    }
}

/// Logical identifier of one remote blob: a folder plus a name.
///
/// Keys are validated on construction so a key can always be rendered to a
/// remote path without further checks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey {
    folder: String,
    name: String,
}

impl BlobKey {
    /// Create a key from a folder and a name.
    ///
    /// The folder may contain `/` to form nested paths (ledger keys do);
    /// every `/`-separated component must be a valid segment.
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let folder = folder.into();
        let name = name.into();
        for component in folder.split('/') {
            validate_segment(&folder, component)?;
        }
        validate_segment(&name, &name)?;
        Ok(Self { folder, name })
    }

    // ---- Well-known singleton keys ----

    pub fn guild_info() -> Self {
        Self::known("info", "guild_info")
    }

    pub fn channel_info() -> Self {
        Self::known("info", "channel_info")
    }

    pub fn category_info() -> Self {
        Self::known("info", "category_info")
    }

    pub fn role_info() -> Self {
        Self::known("info", "role_info")
    }

    pub fn member_map() -> Self {
        Self::known("members", "member_map")
    }

    pub fn role_permissions() -> Self {
        Self::known("permissions", "role_permissions")
    }

    pub fn channel_permissions() -> Self {
        Self::known("permissions", "channel_permissions")
    }

    pub fn category_permissions() -> Self {
        Self::known("permissions", "category_permissions")
    }

    /// All singleton keys loaded eagerly at startup.
    pub fn preload_set() -> Vec<Self> {
        vec![
            Self::guild_info(),
            Self::channel_info(),
            Self::category_info(),
            Self::role_info(),
            Self::member_map(),
            Self::role_permissions(),
            Self::channel_permissions(),
            Self::category_permissions(),
        ]
    }

    // ---- Per-channel keys ----

    /// The message ledger of a channel for the given stream class.
    pub fn ledger(channel_id: &str, class: StreamClass) -> Result<Self> {
        Self::new(format!("messages/{channel_id}"), class.blob_name())
    }

    /// The backfill cursor blob of a channel.
    pub fn stream_cursor(channel_id: &str) -> Result<Self> {
        Self::new(format!("messages/{channel_id}"), "metadata")
    }

    // ---- Accessors ----

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The blob kind this key holds, used to pick empty content and merge
    /// behavior.
    pub fn kind(&self) -> BlobKind {
        if self.folder.starts_with("messages/") {
            if self.name == "metadata" {
                BlobKind::StreamCursor
            } else {
                BlobKind::LedgerMap
            }
        } else if self.folder == "permissions" {
            BlobKind::PermissionMap
        } else if self.folder == "members" {
            BlobKind::MemberMap
        } else if self.name == "guild_info" {
            BlobKind::GuildInfo
        } else if self.name == "role_info" {
            BlobKind::RoleInfo
        } else {
            BlobKind::ChannelInfo
        }
    }

    /// Returns `true` if this key addresses a message ledger.
    pub fn is_ledger(&self) -> bool {
        self.kind() == BlobKind::LedgerMap
    }

    /// Render the remote object path for this key under a server scope.
    pub fn remote_path(&self, scope: &str) -> String {
        format!("{scope}/{}/{}.json", self.folder, self.name)
    }

    fn known(folder: &str, name: &str) -> Self {
        Self {
            folder: folder.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.name)
    }
}

fn validate_segment(key: &str, segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(TypeError::InvalidKey {
            key: key.to_string(),
            reason: "empty path segment".into(),
        });
    }
    if segment == ".." || segment == "." {
        return Err(TypeError::InvalidKey {
            key: key.to_string(),
            reason: "path traversal segment".into(),
        });
    }
    for ch in FORBIDDEN_CHARS {
        if segment.contains(*ch) {
            return Err(TypeError::InvalidKey {
                key: key.to_string(),
                reason: format!("contains forbidden character: {ch:?}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_paths() {
        let key = BlobKey::guild_info();
        assert_eq!(key.remote_path("srv1"), "srv1/info/guild_info.json");
        assert_eq!(key.to_string(), "info/guild_info");
        assert_eq!(key.kind(), BlobKind::GuildInfo);
    }

    #[test]
    fn ledger_paths() {
        let key = BlobKey::ledger("123", StreamClass::Member).unwrap();
        assert_eq!(
            key.remote_path("srv1"),
            "srv1/messages/123/member_messages.json"
        );
        assert!(key.is_ledger());

        let key = BlobKey::ledger("123", StreamClass::Bot).unwrap();
        assert_eq!(key.name(), "bot_messages");
        assert_eq!(key.kind(), BlobKind::LedgerMap);
    }

    #[test]
    fn cursor_key_kind() {
        let key = BlobKey::stream_cursor("123").unwrap();
        assert_eq!(key.kind(), BlobKind::StreamCursor);
        assert!(!key.is_ledger());
        assert_eq!(key.remote_path("s"), "s/messages/123/metadata.json");
    }

    #[test]
    fn rejects_bad_segments() {
        assert!(BlobKey::new("", "x").is_err());
        assert!(BlobKey::new("a//b", "x").is_err());
        assert!(BlobKey::new("..", "x").is_err());
        assert!(BlobKey::new("info", "a b").is_err());
        assert!(BlobKey::ledger("../../etc", StreamClass::Member).is_err());
    }

    #[test]
    fn permission_keys_map_to_permission_kind() {
        for key in [
            BlobKey::role_permissions(),
            BlobKey::channel_permissions(),
            BlobKey::category_permissions(),
        ] {
            assert_eq!(key.kind(), BlobKind::PermissionMap);
        }
    }
}
