//! Typed blob contents and per-kind merge semantics.
//!
//! Every remote blob is one of a closed set of kinds. Representing each kind
//! as a typed variant (instead of an untyped JSON map) makes merge behavior
//! a per-kind definition rather than an ambiguous key-overwrite:
//!
//! - `GuildInfo` / `StreamCursor`: field-wise last-writer-wins; an absent
//!   field in the partial leaves the existing value alone.
//! - `ChannelInfo` / `RoleInfo` / `PermissionMap`: entry-level map union,
//!   the partial's entry replaces the existing one wholesale (shallow).
//! - `MemberMap`: map union with field-wise entry merge (deep), so a partial
//!   member update cannot erase the member's role list.
//! - `LedgerMap`: id-keyed union where existing records are never replaced
//!   or removed (append-only wins).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TypeError};
use crate::record::LedgerMap;

/// The closed set of blob kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobKind {
    GuildInfo,
    ChannelInfo,
    RoleInfo,
    MemberMap,
    PermissionMap,
    LedgerMap,
    StreamCursor,
}

impl BlobKind {
    /// How map-valued kinds merge individual entries.
    pub fn merge_depth(&self) -> MergeDepth {
        match self {
            // A member's entry carries a role list that partial updates
            // must not clobber.
            BlobKind::MemberMap => MergeDepth::Deep,
            _ => MergeDepth::Shallow,
        }
    }

    /// The empty content of this kind (what an absent remote blob decodes to).
    pub fn empty_content(&self) -> BlobContent {
        match self {
            BlobKind::GuildInfo => BlobContent::GuildInfo(GuildInfo::default()),
            BlobKind::ChannelInfo => BlobContent::ChannelInfo(BTreeMap::new()),
            BlobKind::RoleInfo => BlobContent::RoleInfo(BTreeMap::new()),
            BlobKind::MemberMap => BlobContent::MemberMap(BTreeMap::new()),
            BlobKind::PermissionMap => BlobContent::PermissionMap(BTreeMap::new()),
            BlobKind::LedgerMap => BlobContent::LedgerMap(LedgerMap::new()),
            BlobKind::StreamCursor => BlobContent::StreamCursor(StreamCursor::default()),
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobKind::GuildInfo => "guild_info",
            BlobKind::ChannelInfo => "channel_info",
            BlobKind::RoleInfo => "role_info",
            BlobKind::MemberMap => "member_map",
            BlobKind::PermissionMap => "permission_map",
            BlobKind::LedgerMap => "ledger_map",
            BlobKind::StreamCursor => "stream_cursor",
        };
        f.write_str(name)
    }
}

/// Entry-merge behavior for map-valued kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeDepth {
    /// The partial's entry replaces the existing entry wholesale.
    Shallow,
    /// Both entries are JSON objects: union their fields, partial wins
    /// per field. Non-object entries fall back to replacement.
    Deep,
}

/// Singleton guild metadata.
///
/// Field names follow the wire format of the scraped source; unknown fields
/// are preserved through `extra` so a newer producer never strips data a
/// reader still wants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GuildInfo {
    fn merge(&mut self, partial: &GuildInfo) {
        merge_opt(&mut self.id, &partial.id);
        merge_opt(&mut self.name, &partial.name);
        merge_opt(&mut self.description, &partial.description);
        merge_opt(&mut self.icon, &partial.icon);
        merge_opt(&mut self.icon_hash, &partial.icon_hash);
        merge_opt(&mut self.owner_id, &partial.owner_id);
        merge_opt(&mut self.member_count, &partial.member_count);
        for (k, v) in &partial.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

/// Per-channel backfill cursor: the last record id a scan reached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCursor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl StreamCursor {
    fn merge(&mut self, partial: &StreamCursor) {
        merge_opt(&mut self.last_message_id, &partial.last_message_id);
        merge_opt(&mut self.last_update, &partial.last_update);
    }
}

/// The decoded content of one blob, tagged by kind.
///
/// The wire format is the untagged inner value (a plain JSON object or map);
/// the tag exists only in memory, recovered from the [`crate::BlobKey`] at
/// decode time.
#[derive(Clone, Debug, PartialEq)]
pub enum BlobContent {
    GuildInfo(GuildInfo),
    ChannelInfo(BTreeMap<String, Value>),
    RoleInfo(BTreeMap<String, Value>),
    MemberMap(BTreeMap<String, Value>),
    PermissionMap(BTreeMap<String, Value>),
    LedgerMap(LedgerMap),
    StreamCursor(StreamCursor),
}

impl BlobContent {
    /// The kind tag of this content.
    pub fn kind(&self) -> BlobKind {
        match self {
            BlobContent::GuildInfo(_) => BlobKind::GuildInfo,
            BlobContent::ChannelInfo(_) => BlobKind::ChannelInfo,
            BlobContent::RoleInfo(_) => BlobKind::RoleInfo,
            BlobContent::MemberMap(_) => BlobKind::MemberMap,
            BlobContent::PermissionMap(_) => BlobKind::PermissionMap,
            BlobContent::LedgerMap(_) => BlobKind::LedgerMap,
            BlobContent::StreamCursor(_) => BlobKind::StreamCursor,
        }
    }

    /// Decode a raw JSON value as the given kind.
    pub fn from_json(kind: BlobKind, value: Value) -> Result<Self> {
        let decode_err = |e: serde_json::Error| TypeError::Serialization(e.to_string());
        Ok(match kind {
            BlobKind::GuildInfo => {
                BlobContent::GuildInfo(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::ChannelInfo => {
                BlobContent::ChannelInfo(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::RoleInfo => {
                BlobContent::RoleInfo(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::MemberMap => {
                BlobContent::MemberMap(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::PermissionMap => {
                BlobContent::PermissionMap(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::LedgerMap => {
                BlobContent::LedgerMap(serde_json::from_value(value).map_err(decode_err)?)
            }
            BlobKind::StreamCursor => {
                BlobContent::StreamCursor(serde_json::from_value(value).map_err(decode_err)?)
            }
        })
    }

    /// Encode to the raw JSON value stored remotely.
    pub fn to_json(&self) -> Result<Value> {
        let encode = |r: std::result::Result<Value, serde_json::Error>| {
            r.map_err(|e| TypeError::Serialization(e.to_string()))
        };
        match self {
            BlobContent::GuildInfo(v) => encode(serde_json::to_value(v)),
            BlobContent::ChannelInfo(v) => encode(serde_json::to_value(v)),
            BlobContent::RoleInfo(v) => encode(serde_json::to_value(v)),
            BlobContent::MemberMap(v) => encode(serde_json::to_value(v)),
            BlobContent::PermissionMap(v) => encode(serde_json::to_value(v)),
            BlobContent::LedgerMap(v) => encode(serde_json::to_value(v)),
            BlobContent::StreamCursor(v) => encode(serde_json::to_value(v)),
        }
    }

    /// Merge a partial of the same kind into this content.
    ///
    /// Idempotent: applying the same partial twice yields the same result
    /// as applying it once.
    pub fn merge(&mut self, partial: &BlobContent) -> Result<()> {
        match (self, partial) {
            (BlobContent::GuildInfo(base), BlobContent::GuildInfo(p)) => base.merge(p),
            (BlobContent::StreamCursor(base), BlobContent::StreamCursor(p)) => base.merge(p),
            (BlobContent::ChannelInfo(base), BlobContent::ChannelInfo(p)) => {
                merge_map(base, p, BlobKind::ChannelInfo.merge_depth())
            }
            (BlobContent::RoleInfo(base), BlobContent::RoleInfo(p)) => {
                merge_map(base, p, BlobKind::RoleInfo.merge_depth())
            }
            (BlobContent::MemberMap(base), BlobContent::MemberMap(p)) => {
                merge_map(base, p, BlobKind::MemberMap.merge_depth())
            }
            (BlobContent::PermissionMap(base), BlobContent::PermissionMap(p)) => {
                merge_map(base, p, BlobKind::PermissionMap.merge_depth())
            }
            (BlobContent::LedgerMap(base), BlobContent::LedgerMap(p)) => {
                for (id, record) in p {
                    base.entry(id.clone()).or_insert_with(|| record.clone());
                }
            }
            (base, partial) => {
                return Err(TypeError::KindMismatch {
                    expected: base.kind().to_string(),
                    actual: partial.kind().to_string(),
                })
            }
        }
        Ok(())
    }

    /// Number of records, for ledger contents.
    pub fn record_count(&self) -> Option<usize> {
        match self {
            BlobContent::LedgerMap(map) => Some(map.len()),
            _ => None,
        }
    }

    pub fn as_ledger(&self) -> Option<&LedgerMap> {
        match self {
            BlobContent::LedgerMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_ledger_mut(&mut self) -> Option<&mut LedgerMap> {
        match self {
            BlobContent::LedgerMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_guild_info(&self) -> Option<&GuildInfo> {
        match self {
            BlobContent::GuildInfo(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_stream_cursor(&self) -> Option<&StreamCursor> {
        match self {
            BlobContent::StreamCursor(cursor) => Some(cursor),
            _ => None,
        }
    }
}

fn merge_opt<T: Clone>(base: &mut Option<T>, partial: &Option<T>) {
    if let Some(v) = partial {
        *base = Some(v.clone());
    }
}

fn merge_map(base: &mut BTreeMap<String, Value>, partial: &BTreeMap<String, Value>, depth: MergeDepth) {
    for (k, v) in partial {
        match (depth, base.get_mut(k)) {
            (MergeDepth::Deep, Some(Value::Object(existing))) => {
                if let Value::Object(incoming) = v {
                    for (field, value) in incoming {
                        existing.insert(field.clone(), value.clone());
                    }
                } else {
                    base.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}
