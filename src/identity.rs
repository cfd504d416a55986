//! Node identities.
//!
//! A node id is a lexicographically sortable string: a zero-padded election
//! priority prefix (two digits, so a *lower* priority number sorts *first*)
//! followed by a random unique suffix. Elections pick the smallest id, which
//! makes the priority prefix the primary tie-break and the random suffix the
//! final one.
//!
//! The human-readable name is a fixed slice of the id, stable for the node's
//! lifetime.

use uuid::Uuid;

/// Highest accepted election priority (inclusive).
pub const MAX_ELECTION_PRIORITY: u8 = 99;

/// Byte range of an id exposed as the node name.
const NAME_RANGE: std::ops::Range<usize> = 3..11;

/// Prefix that makes an advertised id sort after every real member id.
const RESIGN_PREFIX: &str = "zz-zzzzzzzz-";

/// Immutable identity of a node: sortable id plus derived display name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    id: String,
    name: String,
}

impl NodeId {
    /// Identity for a voting member node.
    ///
    /// `election_priority` must already be validated to `0..=99`; priority 0
    /// produces the smallest prefix and therefore the most preferred id.
    pub fn member(election_priority: u8) -> Self {
        let id = format!(
            "{:02}-{}",
            election_priority.min(MAX_ELECTION_PRIORITY),
            Uuid::new_v4()
        );
        Self::from_id(id)
    }

    /// Identity for a non-voting external node.
    pub fn external() -> Self {
        Self::from_id(format!("EX-{}", Uuid::new_v4()))
    }

    fn from_id(id: String) -> Self {
        let name = node_id_to_name(&id).to_string();
        Self { id, name }
    }

    /// The full sortable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The fixed-length display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An id advertised while resigning: sorts after every real candidate so
    /// this node cannot win the election it calls before deactivating.
    ///
    /// The real id is never mutated; the advertised value only rides along
    /// inside the one election round that uses it.
    pub fn resignation_id(&self) -> String {
        format!("{RESIGN_PREFIX}{}", self.id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Derive the display name slice from any node id.
pub fn node_id_to_name(id: &str) -> &str {
    id.get(NAME_RANGE).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_priority_prefix() {
        let preferred = NodeId::member(0);
        let fallback = NodeId::member(99);
        assert!(preferred.id().starts_with("00-"));
        assert!(fallback.id().starts_with("99-"));
    }

    #[test]
    fn test_lower_priority_number_sorts_first() {
        // Smallest id wins an election, so priority 0 must sort before
        // priority 2 regardless of the random suffix.
        let p0 = NodeId::member(0);
        let p2 = NodeId::member(2);
        assert!(p0.id() < p2.id());
    }

    #[test]
    fn test_name_is_fixed_slice() {
        let id = NodeId::member(0);
        assert_eq!(id.name().len(), 8);
        assert_eq!(id.name(), &id.id()[3..11]);
    }

    #[test]
    fn test_external_id_prefix() {
        let id = NodeId::external();
        assert!(id.id().starts_with("EX-"));
        assert_eq!(id.name().len(), 8);
    }

    #[test]
    fn test_resignation_id_sorts_after_member_ids() {
        let id = NodeId::member(99);
        let resign = id.resignation_id();
        assert!(resign.as_str() > id.id());
        // also after the highest-possible real prefix
        assert!(resign.as_str() > "99-ffffffff");
    }

    #[test]
    fn test_name_of_short_id_falls_back_to_id() {
        assert_eq!(node_id_to_name("xy"), "xy");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = NodeId::member(0);
        let b = NodeId::member(0);
        assert_ne!(a.id(), b.id());
    }
}
