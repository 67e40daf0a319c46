//! Core domain model for the forum mirror importer.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fmi-core";

/// External identifier of a post on the remote forum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

impl PostId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PostId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PostId)
    }
}

impl From<u64> for PostId {
    fn from(value: u64) -> Self {
        PostId(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    #[default]
    Question,
    Answer,
    Comment,
}

impl PostType {
    /// Maps the remote numeric `type_id`. Every top-level type the forum knows
    /// (jobs, tutorials, news, ...) collapses into `Question`.
    pub fn from_type_id(type_id: i64) -> Self {
        match type_id {
            1 => PostType::Answer,
            6 => PostType::Comment,
            _ => PostType::Question,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "question" => Some(PostType::Question),
            "answer" => Some(PostType::Answer),
            "comment" => Some(PostType::Comment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Question => "question",
            PostType::Answer => "answer",
            PostType::Comment => "comment",
        }
    }

    /// Answers and comments hang off another post.
    pub fn is_reply(self) -> bool {
        matches!(self, PostType::Answer | PostType::Comment)
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized shape of one post as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemotePostRecord {
    pub id: Option<PostId>,
    pub post_type: PostType,
    pub title: String,
    pub html: String,
    pub content: String,
    pub view_count: i64,
    pub creation_date: Option<DateTime<Utc>>,
    pub lastedit_date: Option<DateTime<Utc>>,
    pub parent_id: Option<PostId>,
    pub root_id: Option<PostId>,
    pub author_id: String,
    pub status: Option<i32>,
    pub tag_val: String,
}

/// Persisted post. `uid` is the external identifier, `key` the local storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPost {
    pub key: i64,
    pub uid: PostId,
    pub post_type: PostType,
    pub title: String,
    pub content: String,
    pub html: String,
    pub view_count: i64,
    pub creation_date: Option<DateTime<Utc>>,
    pub lastedit_date: Option<DateTime<Utc>>,
    pub status: Option<i32>,
    pub tag_val: String,
    pub author_uid: String,
    pub parent_uid: Option<PostId>,
    pub root_uid: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub key: i64,
    pub uid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Full set of mutable post fields handed to the store for one upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostWrite {
    pub uid: PostId,
    pub post_type: PostType,
    pub title: String,
    pub content: String,
    pub html: String,
    pub view_count: i64,
    pub creation_date: Option<DateTime<Utc>>,
    pub lastedit_date: Option<DateTime<Utc>>,
    pub status: Option<i32>,
    pub tag_val: String,
    pub author_uid: String,
    pub parent_uid: Option<PostId>,
    pub root_uid: Option<PostId>,
}

impl PostWrite {
    pub fn from_record(
        uid: PostId,
        record: &RemotePostRecord,
        author: &LocalUser,
        parent_uid: Option<PostId>,
        root_uid: Option<PostId>,
    ) -> Self {
        Self {
            uid,
            post_type: record.post_type,
            title: record.title.clone(),
            content: record.content.clone(),
            html: record.html.clone(),
            view_count: record.view_count,
            creation_date: record.creation_date,
            lastedit_date: record.lastedit_date,
            status: record.status,
            tag_val: record.tag_val.clone(),
            author_uid: author.uid.clone(),
            parent_uid,
            root_uid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertKind {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    MissingAuthor,
    /// A stub was requested for a post that already exists locally.
    AlreadyPresent,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NotFound => "not_found",
            SkipReason::MissingAuthor => "missing_author",
            SkipReason::AlreadyPresent => "already_present",
        })
    }
}

/// Result of synchronizing a single post identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Created,
    Updated,
    Skipped(SkipReason),
    /// The author had to be provisioned; the post is picked up on a later pass.
    Deferred,
}

impl From<UpsertKind> for SyncOutcome {
    fn from(kind: UpsertKind) -> Self {
        match kind {
            UpsertKind::Created => SyncOutcome::Created,
            UpsertKind::Updated => SyncOutcome::Updated,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Created => f.write_str("created"),
            SyncOutcome::Updated => f.write_str("updated"),
            SyncOutcome::Skipped(reason) => write!(f, "skipped({reason})"),
            SyncOutcome::Deferred => f.write_str("deferred"),
        }
    }
}
