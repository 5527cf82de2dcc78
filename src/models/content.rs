//! Content-related domain models
//!
//! Items as received from the content API, the queries used to fetch them,
//! the tracked entities they are matched against, and the stored records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream league identifier
pub type LeagueId = u64;

/// Upstream team/entity identifier
pub type EntityId = u64;

/// Local record identifier assigned by the upsert sink
pub type RecordId = i64;

/// Operator-chosen key of a tracked entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A team or league the operator wants content for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub key: EntityKey,

    /// Display name
    pub name: String,

    /// League the entity plays in
    #[serde(default)]
    pub league_id: Option<LeagueId>,

    /// Stable upstream identifiers that map to this entity
    #[serde(default)]
    pub identifiers: Vec<EntityId>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TrackedEntity {
    pub fn new(key: impl Into<EntityKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            league_id: None,
            identifiers: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_league(mut self, league_id: LeagueId) -> Self {
        self.league_id = Some(league_id);
        self
    }

    pub fn with_identifiers(mut self, identifiers: Vec<EntityId>) -> Self {
        self.identifiers = identifiers;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether an upstream id belongs to this entity
    pub fn has_identifier(&self, id: EntityId) -> bool {
        self.identifiers.contains(&id)
    }
}

/// Image attached to a content item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub url: String,
    pub caption: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// An article as delivered by the content API
///
/// Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContentItem {
    pub external_id: String,
    pub headline: String,
    pub body: String,
    pub byline: Option<String>,
    pub home_entity_id: Option<EntityId>,
    pub away_entity_id: Option<EntityId>,
    pub league_id: Option<LeagueId>,
    pub content_type: String,
    pub updated_at: DateTime<Utc>,
    pub image: Option<ImageDescriptor>,
}

impl RawContentItem {
    /// Create an item with empty body and a `story` content type
    pub fn new(external_id: impl Into<String>, headline: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            headline: headline.into(),
            body: String::new(),
            byline: None,
            home_entity_id: None,
            away_entity_id: None,
            league_id: None,
            content_type: "story".to_string(),
            updated_at: Utc::now(),
            image: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_home(mut self, id: EntityId) -> Self {
        self.home_entity_id = Some(id);
        self
    }

    pub fn with_away(mut self, id: EntityId) -> Self {
        self.away_entity_id = Some(id);
        self
    }

    pub fn with_league(mut self, league_id: LeagueId) -> Self {
        self.league_id = Some(league_id);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Home then away identifier, skipping absent ones
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.home_entity_id.iter().chain(self.away_entity_id.iter()).copied()
    }
}

/// Parameters of one content window fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentWindowQuery {
    /// Restrict to one league
    pub league: Option<LeagueId>,

    /// Exclusive lower bound on the update timestamp; `None` is a full backfill
    pub cutoff: Option<DateTime<Utc>>,
}

impl ContentWindowQuery {
    pub fn new(league: Option<LeagueId>, cutoff: Option<DateTime<Utc>>) -> Self {
        Self { league, cutoff }
    }

    /// Cutoff as the ISO-8601 UTC value of the `since` parameter
    pub fn since_param(&self) -> Option<String> {
        self.cutoff
            .map(|c| c.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Window element that could not be decoded into an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    /// Upstream id, when the element carried a readable one
    pub external_id: Option<String>,
    pub reason: String,
}

/// Decoded items of one window plus the elements that failed to decode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentWindow {
    pub items: Vec<RawContentItem>,
    pub rejected: Vec<RejectedItem>,
}

impl From<Vec<RawContentItem>> for ContentWindow {
    fn from(items: Vec<RawContentItem>) -> Self {
        Self {
            items,
            rejected: Vec::new(),
        }
    }
}

/// What the upsert sink stores for an imported item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub external_id: String,
    pub entity_key: EntityKey,
    pub league_id: Option<LeagueId>,
    pub headline: String,
    pub body: String,
    pub byline: Option<String>,
    pub content_type: String,
    pub image: Option<ImageDescriptor>,

    /// Upstream modification time
    pub source_updated_at: DateTime<Utc>,

    pub imported_at: DateTime<Utc>,
    pub import_source: String,
}

impl ContentRecord {
    /// Build the record for an item, stamping import metadata
    pub fn from_item(
        item: &RawContentItem,
        entity_key: &EntityKey,
        import_source: &str,
        imported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: item.external_id.clone(),
            entity_key: entity_key.clone(),
            league_id: item.league_id,
            headline: item.headline.clone(),
            body: item.body.clone(),
            byline: item.byline.clone(),
            content_type: item.content_type.clone(),
            image: item.image.clone(),
            source_updated_at: item.updated_at,
            imported_at,
            import_source: import_source.to_string(),
        }
    }
}
