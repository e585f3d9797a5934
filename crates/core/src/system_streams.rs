use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{StreamId, CUSTOMER_PREFIX, PRIVATE_PREFIX};

/// Definition of one node in the fixed system-streams tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStreamDef {
    /// Unprefixed name (`email`, `storageUsed`).
    pub suffix: String,
    /// Suffix of the parent node; `None` for top-level nodes.
    pub parent: Option<String>,
    /// Private nodes use the `:_system:` namespace, others `:system:`.
    pub private: bool,
    /// Value uniqueness enforced across users.
    pub indexed: bool,
    /// Must be supplied at registration.
    pub required_at_registration: bool,
    /// Whether `account.update` may write this leaf.
    pub editable: bool,
}

impl SystemStreamDef {
    /// The full prefixed stream id for this node.
    #[must_use]
    pub fn id(&self) -> StreamId {
        let prefix = if self.private {
            PRIVATE_PREFIX
        } else {
            CUSTOMER_PREFIX
        };
        StreamId::new(format!("{prefix}{}", self.suffix))
    }
}

/// Root under which legacy tags are mapped to streams.
pub const TAG_ROOT: &str = ":_system:tag-root";

/// Prefix of per-tag stream ids under [`TAG_ROOT`].
pub const TAG_PREFIX: &str = ":_system:tag-";

/// The fixed per-tenant system-streams tree.
///
/// Structure is immutable to end users: system streams can never be
/// created, updated, or deleted through the streams API. Account state is
/// stored as events on the account leaves.
#[derive(Debug, Clone)]
pub struct SystemStreamsModel {
    defs: Vec<SystemStreamDef>,
    by_id: HashMap<StreamId, usize>,
    by_suffix: HashMap<String, usize>,
}

fn node(
    suffix: &str,
    parent: Option<&str>,
    private: bool,
    indexed: bool,
    required: bool,
    editable: bool,
) -> SystemStreamDef {
    SystemStreamDef {
        suffix: suffix.to_owned(),
        parent: parent.map(str::to_owned),
        private,
        indexed,
        required_at_registration: required,
        editable,
    }
}

impl SystemStreamsModel {
    /// The built-in tree: `account` (with its leaves), `storageUsed`,
    /// `helpers`, and the tag root. `extra_account_leaves` appends
    /// customer-defined leaves under `account` as `(suffix, indexed,
    /// required_at_registration)`.
    #[must_use]
    pub fn with_account_leaves(extra_account_leaves: &[(&str, bool, bool)]) -> Self {
        let mut defs = vec![
            node("account", None, false, false, false, false),
            node("email", Some("account"), false, true, true, true),
            node("language", Some("account"), false, false, false, true),
            node("storageUsed", None, true, false, false, false),
            node("helpers", None, true, false, false, false),
            node("active", Some("helpers"), true, false, false, false),
            node("inactive", Some("helpers"), true, false, false, false),
            node("tag-root", None, true, false, false, false),
        ];
        for (suffix, indexed, required) in extra_account_leaves {
            defs.push(node(suffix, Some("account"), false, *indexed, *required, true));
        }

        let mut by_id = HashMap::with_capacity(defs.len());
        let mut by_suffix = HashMap::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            by_id.insert(def.id(), i);
            by_suffix.insert(def.suffix.clone(), i);
        }
        Self {
            defs,
            by_id,
            by_suffix,
        }
    }

    /// Look up a node by its full prefixed id.
    #[must_use]
    pub fn get(&self, id: &StreamId) -> Option<&SystemStreamDef> {
        if let Some(&i) = self.by_id.get(id) {
            return Some(&self.defs[i]);
        }
        // Tag streams are implicit children of the tag root.
        if id.as_str().starts_with(TAG_PREFIX) && id.as_str() != TAG_ROOT {
            return self.by_id.get(&StreamId::new(TAG_ROOT)).map(|&i| &self.defs[i]);
        }
        None
    }

    /// Whether `id` names a registered system stream (or an implicit tag
    /// stream).
    #[must_use]
    pub fn contains(&self, id: &StreamId) -> bool {
        self.get(id).is_some()
    }

    /// Resolve a legacy unprefixed suffix (`email` from `.email`) to the
    /// registered node.
    #[must_use]
    pub fn by_suffix(&self, suffix: &str) -> Option<&SystemStreamDef> {
        self.by_suffix.get(suffix).map(|&i| &self.defs[i])
    }

    /// Ids of leaves whose values are unique across users.
    #[must_use]
    pub fn indexed_ids(&self) -> Vec<StreamId> {
        self.defs
            .iter()
            .filter(|d| d.indexed)
            .map(SystemStreamDef::id)
            .collect()
    }

    /// Account leaves required at registration.
    #[must_use]
    pub fn required_at_registration(&self) -> Vec<&SystemStreamDef> {
        self.defs
            .iter()
            .filter(|d| d.required_at_registration)
            .collect()
    }

    /// Editable account leaves, in declaration order.
    #[must_use]
    pub fn account_leaves(&self) -> Vec<&SystemStreamDef> {
        self.defs
            .iter()
            .filter(|d| d.parent.as_deref() == Some("account"))
            .collect()
    }

    /// All registered nodes.
    #[must_use]
    pub fn defs(&self) -> &[SystemStreamDef] {
        &self.defs
    }
}

impl Default for SystemStreamsModel {
    fn default() -> Self {
        Self::with_account_leaves(&[])
    }
}

/// The stream id a legacy tag maps to.
#[must_use]
pub fn tag_stream_id(tag: &str) -> StreamId {
    StreamId::new(format!("{TAG_PREFIX}{tag}"))
}

/// The tag encoded in a tag stream id, if it is one.
#[must_use]
pub fn tag_from_stream_id(id: &StreamId) -> Option<&str> {
    if id.as_str() == TAG_ROOT {
        return None;
    }
    id.as_str().strip_prefix(TAG_PREFIX)
}
