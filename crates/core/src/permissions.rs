use crate::access::{Access, FeatureSetting, Permission, PermissionLevel, FEATURE_SELF_REVOKE};
use crate::error::ApiError;
use crate::stream::StreamTree;
use crate::types::StreamId;

/// Read-only view combining an access's permission atoms with the owning
/// user's stream tree. All capability questions are answered here; the
/// evaluator is a pure function of `(permissions, tree, stream id)`.
pub struct PermissionView<'a> {
    access: &'a Access,
    tree: &'a StreamTree,
}

impl<'a> PermissionView<'a> {
    #[must_use]
    pub fn new(access: &'a Access, tree: &'a StreamTree) -> Self {
        Self { access, tree }
    }

    #[must_use]
    pub fn access(&self) -> &Access {
        self.access
    }

    /// Whether `atom_stream` covers `target`: the wildcard covers everything,
    /// otherwise the atom's scope is the stream plus its descendants (an atom
    /// on a stream absent from the tree scopes that id alone).
    fn scope_contains(&self, atom_stream: &StreamId, target: &StreamId) -> bool {
        if atom_stream.is_star() {
            return true;
        }
        atom_stream == target || self.tree.in_scope_of(target, atom_stream)
    }

    /// Whether a `level=none` atom covers `target`. Forced exclusions win
    /// over any broader grant, including `*`-wide manage.
    #[must_use]
    pub fn is_forced_none(&self, target: &StreamId) -> bool {
        self.access.permissions.iter().any(|p| {
            matches!(p, Permission::Stream { stream_id, level }
                if *level == PermissionLevel::None && self.scope_contains(stream_id, target))
        })
    }

    /// The effective level for `target`: the maximum level over all atoms
    /// whose scope contains it, unless a forced exclusion covers it.
    /// Personal accesses manage the entire forest.
    #[must_use]
    pub fn effective_level(&self, target: &StreamId) -> PermissionLevel {
        if self.access.is_personal() {
            return PermissionLevel::Manage;
        }
        if self.is_forced_none(target) {
            return PermissionLevel::None;
        }
        self.access
            .permissions
            .iter()
            .filter_map(|p| match p {
                Permission::Stream { stream_id, level }
                    if self.scope_contains(stream_id, target) =>
                {
                    Some(*level)
                }
                _ => None,
            })
            .max()
            .unwrap_or(PermissionLevel::None)
    }

    #[must_use]
    pub fn can_get_events_on_stream(&self, target: &StreamId) -> bool {
        self.effective_level(target).can_read()
    }

    #[must_use]
    pub fn can_create_events_on_stream(&self, target: &StreamId) -> bool {
        self.effective_level(target).can_create()
    }

    #[must_use]
    pub fn can_update_events_on_stream(&self, target: &StreamId) -> bool {
        self.effective_level(target).can_update()
    }

    #[must_use]
    pub fn can_manage_stream(&self, target: &StreamId) -> bool {
        self.effective_level(target).can_manage()
    }

    /// Whether `target` appears in `streams.get` output. A `create-only`
    /// grant shows the granted stream itself but blocks listing its
    /// descendants.
    #[must_use]
    pub fn can_list_stream(&self, target: &StreamId) -> bool {
        if self.effective_level(target).can_read() {
            return true;
        }
        self.access.permissions.iter().any(|p| {
            matches!(p, Permission::Stream { stream_id, level }
                if *level == PermissionLevel::CreateOnly && stream_id == target)
        }) && !self.is_forced_none(target)
    }

    /// Read access to a multi-stream event: read on at least one stream.
    #[must_use]
    pub fn can_read_event(&self, stream_ids: &[StreamId]) -> bool {
        stream_ids.iter().any(|s| self.can_get_events_on_stream(s))
    }

    /// Create access: at least one stream grants create and none of them is
    /// a forced exclusion.
    #[must_use]
    pub fn can_create_event(&self, stream_ids: &[StreamId]) -> bool {
        stream_ids
            .iter()
            .any(|s| self.can_create_events_on_stream(s))
            && !stream_ids.iter().any(|s| self.is_forced_none(s))
    }

    /// Update/delete access: contribute on at least one of the event's
    /// streams.
    #[must_use]
    pub fn can_update_event(&self, stream_ids: &[StreamId]) -> bool {
        stream_ids
            .iter()
            .any(|s| self.can_update_events_on_stream(s))
    }

    /// Moving an event between streams requires the create capability on
    /// every added stream (on top of update access to the event itself).
    #[must_use]
    pub fn can_move_event_to(&self, added_stream_ids: &[StreamId]) -> bool {
        added_stream_ids
            .iter()
            .all(|s| self.can_create_events_on_stream(s) && !self.is_forced_none(s))
    }

    /// The permission atoms reported by `access-info`: personal accesses
    /// expose a `*`-wide manage grant, others their own atoms.
    #[must_use]
    pub fn effective_permissions(&self) -> Vec<Permission> {
        if self.access.is_personal() {
            return vec![Permission::Stream {
                stream_id: StreamId::star(),
                level: PermissionLevel::Manage,
            }];
        }
        self.access.permissions.clone()
    }
}

/// Check the subset relation (reflexive, transitive) between a candidate
/// permission set and the creating access.
///
/// For every stream atom the candidate declares, the creator's effective
/// level on that scope must be at least the declared level; in particular
/// `manage` is only delegable by a manager of that scope. Declaring
/// `level=none` is always a narrowing and passes. Feature atoms pass
/// through; a creator that forbids self-revocation cannot issue a child
/// without that restriction (see [`inherit_features`]).
pub fn verify_subset(candidate: &[Permission], creator: &PermissionView<'_>) -> Result<(), ApiError> {
    for atom in candidate {
        match atom {
            Permission::Stream { stream_id, level } => {
                if *level == PermissionLevel::None {
                    continue;
                }
                let held = creator.effective_level(stream_id);
                if held < *level {
                    return Err(ApiError::forbidden(format!(
                        "Insufficient permissions on stream \"{stream_id}\": \
                         cannot delegate level beyond the one held"
                    )));
                }
            }
            Permission::Feature { .. } => {}
        }
    }
    Ok(())
}

/// Propagate inherited feature atoms from the creator onto a candidate
/// permission set: `selfRevoke=forbidden` is sticky across delegation.
#[must_use]
pub fn inherit_features(creator: &Access, mut candidate: Vec<Permission>) -> Vec<Permission> {
    if creator.forbids_self_revoke()
        && !candidate.iter().any(|p| {
            matches!(p, Permission::Feature { feature, .. } if feature == FEATURE_SELF_REVOKE)
        })
    {
        candidate.push(Permission::Feature {
            feature: FEATURE_SELF_REVOKE.to_owned(),
            setting: FeatureSetting::Forbidden,
        });
    }
    candidate
}
