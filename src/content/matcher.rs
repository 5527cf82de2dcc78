//! Entity matching
//!
//! Items are attributed to tracked entities by stable numeric identifiers
//! only. Names are never compared.

use crate::models::{EntityKey, RawContentItem, TrackedEntity};

/// Find the entity an item belongs to
///
/// The home identifier is tried before the away identifier, and entities are
/// tried in the order given. Disabled entities never match.
pub fn match_item(item: &RawContentItem, entities: &[TrackedEntity]) -> Option<EntityKey> {
    item.entity_ids().find_map(|id| {
        entities
            .iter()
            .filter(|e| e.enabled)
            .find(|e| e.has_identifier(id))
            .map(|e| e.key.clone())
    })
}
