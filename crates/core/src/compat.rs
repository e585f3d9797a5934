use std::sync::Arc;

use serde_json::Value;

use crate::system_streams::{tag_from_stream_id, tag_stream_id, SystemStreamsModel};
use crate::types::{StreamId, CUSTOMER_PREFIX};

/// Request header suppressing egress prefix translation.
pub const DISABLE_COMPAT_HEADER: &str = "disable-backward-compatibility-prefix";

/// Ingress/egress translator between legacy dot-prefixed stream ids
/// (`.email`) and the canonical system namespaces (`:system:email`,
/// `:_system:storageUsed`), plus the legacy `tags` mapping.
///
/// Only canonical ids circulate past ingress; the evaluators never see the
/// legacy form.
#[derive(Debug, Clone)]
pub struct BackwardCompat {
    active: bool,
    model: Arc<SystemStreamsModel>,
}

impl BackwardCompat {
    #[must_use]
    pub fn new(active: bool, model: Arc<SystemStreamsModel>) -> Self {
        Self { active, model }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Translate one stream id on request ingress. Unrecognized dot ids
    /// default to the customer namespace.
    #[must_use]
    pub fn ingress_stream_id(&self, raw: &str) -> StreamId {
        if !self.active {
            return StreamId::new(raw);
        }
        let Some(suffix) = raw.strip_prefix('.') else {
            return StreamId::new(raw);
        };
        if suffix.is_empty() {
            return StreamId::new(raw);
        }
        match self.model.by_suffix(suffix) {
            Some(def) => def.id(),
            None => StreamId::new(format!("{CUSTOMER_PREFIX}{suffix}")),
        }
    }

    /// Translate one stream id on response egress: registered system ids
    /// regain their dot form unless the request disabled compatibility.
    #[must_use]
    pub fn egress_stream_id(&self, id: &StreamId, disabled_by_header: bool) -> String {
        if !self.active || disabled_by_header {
            return id.to_string();
        }
        if let Some(def) = self.model.get(id)
            && def.id() == *id
        {
            return format!(".{}", def.suffix);
        }
        id.to_string()
    }

    /// Rewrite an event document in place on ingress: translate
    /// `streamIds` entries and fold a legacy `tags` array into tag streams.
    pub fn ingress_event(&self, event: &mut Value) {
        if !self.active {
            return;
        }
        self.ingress_stream_ids_field(event);

        let Some(tags) = event.get("tags").and_then(Value::as_array).cloned() else {
            return;
        };
        if tags.is_empty() {
            return;
        }
        let stream_ids = event
            .get_mut("streamIds")
            .and_then(Value::as_array_mut);
        if let Some(ids) = stream_ids {
            for tag in tags.iter().filter_map(Value::as_str) {
                let tid = Value::String(tag_stream_id(tag).to_string());
                if !ids.contains(&tid) {
                    ids.push(tid);
                }
            }
        }
        if let Some(obj) = event.as_object_mut() {
            obj.remove("tags");
        }
    }

    /// Rewrite an event document in place on egress: translate ids back and
    /// surface tag streams as a `tags` array.
    pub fn egress_event(&self, event: &mut Value, disabled_by_header: bool) {
        if !self.active || disabled_by_header {
            return;
        }
        let mut tags: Vec<Value> = Vec::new();
        if let Some(ids) = event.get_mut("streamIds").and_then(Value::as_array_mut) {
            let mut kept = Vec::with_capacity(ids.len());
            for id in ids.drain(..) {
                let Some(s) = id.as_str() else {
                    kept.push(id);
                    continue;
                };
                let sid = StreamId::new(s);
                if let Some(tag) = tag_from_stream_id(&sid) {
                    tags.push(Value::String(tag.to_owned()));
                } else {
                    kept.push(Value::String(self.egress_stream_id(&sid, false)));
                }
            }
            *ids = kept;
        }
        if !tags.is_empty() {
            event["tags"] = Value::Array(tags);
        }
    }

    /// Translate the `streamIds` array of a document in place (ingress).
    pub fn ingress_stream_ids_field(&self, doc: &mut Value) {
        if !self.active {
            return;
        }
        if let Some(ids) = doc.get_mut("streamIds").and_then(Value::as_array_mut) {
            for id in ids.iter_mut() {
                if let Some(s) = id.as_str() {
                    *id = Value::String(self.ingress_stream_id(s).to_string());
                }
            }
        }
    }

    /// Translate the `streamId` of each permission atom in place (ingress).
    pub fn ingress_permissions(&self, permissions: &mut Value) {
        if !self.active {
            return;
        }
        let Some(atoms) = permissions.as_array_mut() else {
            return;
        };
        for atom in atoms {
            if let Some(raw) = atom.get("streamId").and_then(Value::as_str) {
                let translated = self.ingress_stream_id(raw).to_string();
                atom["streamId"] = Value::String(translated);
            }
        }
    }

    /// Translate the `streamId` of each permission atom in place (egress).
    pub fn egress_permissions(&self, permissions: &mut Value, disabled_by_header: bool) {
        if !self.active || disabled_by_header {
            return;
        }
        let Some(atoms) = permissions.as_array_mut() else {
            return;
        };
        for atom in atoms {
            if let Some(raw) = atom.get("streamId").and_then(Value::as_str) {
                let translated = self.egress_stream_id(&StreamId::new(raw), false);
                atom["streamId"] = Value::String(translated);
            }
        }
    }

    /// Translate a stream document's `id` and `parentId` on egress.
    pub fn egress_stream(&self, stream: &mut Value, disabled_by_header: bool) {
        if !self.active || disabled_by_header {
            return;
        }
        for field in ["id", "parentId"] {
            if let Some(raw) = stream.get(field).and_then(Value::as_str) {
                let translated = self.egress_stream_id(&StreamId::new(raw), false);
                stream[field] = Value::String(translated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compat(active: bool) -> BackwardCompat {
        BackwardCompat::new(active, Arc::new(SystemStreamsModel::default()))
    }

    #[test]
    fn ingress_matches_registered_namespace() {
        let c = compat(true);
        assert_eq!(c.ingress_stream_id(".email").as_str(), ":system:email");
        assert_eq!(
            c.ingress_stream_id(".storageUsed").as_str(),
            ":_system:storageUsed"
        );
        // Unregistered dot ids default to the customer namespace.
        assert_eq!(c.ingress_stream_id(".foo").as_str(), ":system:foo");
        // Canonical and plain ids pass through.
        assert_eq!(c.ingress_stream_id("diary").as_str(), "diary");
        assert_eq!(c.ingress_stream_id(":system:email").as_str(), ":system:email");
    }

    #[test]
    fn inactive_layer_is_identity() {
        let c = compat(false);
        assert_eq!(c.ingress_stream_id(".email").as_str(), ".email");
        assert_eq!(
            c.egress_stream_id(&StreamId::new(":system:email"), false),
            ":system:email"
        );
    }

    #[test]
    fn egress_restores_dot_form_unless_disabled() {
        let c = compat(true);
        let id = StreamId::new(":system:email");
        assert_eq!(c.egress_stream_id(&id, false), ".email");
        assert_eq!(c.egress_stream_id(&id, true), ":system:email");
        assert_eq!(c.egress_stream_id(&StreamId::new("diary"), false), "diary");
    }

    #[test]
    fn event_tags_fold_into_tag_streams_and_back() {
        let c = compat(true);
        let mut event = json!({
            "streamIds": ["diary"],
            "tags": ["health", "sport"]
        });
        c.ingress_event(&mut event);
        assert!(event.get("tags").is_none());
        let ids: Vec<&str> = event["streamIds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["diary", ":_system:tag-health", ":_system:tag-sport"]);

        c.egress_event(&mut event, false);
        assert_eq!(event["streamIds"], json!(["diary"]));
        assert_eq!(event["tags"], json!(["health", "sport"]));
    }

    #[test]
    fn egress_event_respects_disable_header() {
        let c = compat(true);
        let mut event = json!({ "streamIds": [":system:email", "diary"] });
        c.egress_event(&mut event, true);
        assert_eq!(event["streamIds"], json!([":system:email", "diary"]));
    }

    #[test]
    fn permissions_translate_both_ways() {
        let c = compat(true);
        let mut perms = json!([{ "streamId": ".email", "level": "read" }]);
        c.ingress_permissions(&mut perms);
        assert_eq!(perms[0]["streamId"], ":system:email");
        c.egress_permissions(&mut perms, false);
        assert_eq!(perms[0]["streamId"], ".email");
    }
}
