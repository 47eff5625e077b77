use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable handle for a dialog, independent of its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId(pub Uuid);

impl DialogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DialogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a dialog on the wire (RFC 3261 Section 12): Call-ID plus the
/// local and remote tags, seen from this side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogKey {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_dialog_id_is_unique() {
        let id1 = DialogId::new();
        let id2 = DialogId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string(), id1.0.to_string());
    }

    #[test]
    fn test_dialog_key_tags_are_directional() {
        let ours = DialogKey::new("call-1", "a", "b");
        let swapped = DialogKey::new("call-1", "b", "a");
        let mut keys = HashSet::new();
        keys.insert(ours.clone());
        assert!(keys.contains(&DialogKey::new("call-1", "a", "b")));
        assert!(!keys.contains(&swapped));
        assert_eq!(ours.to_string(), "call-1;local=a;remote=b");
    }
}
