use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::{StreamId, Tracking};

/// A node in a user's stream forest, as persisted.
///
/// Hierarchy is encoded by `parent_id` only; the in-memory [`StreamTree`]
/// materializes child links for traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: StreamId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub trashed: bool,
    /// Duration-bearing events on this stream may not overlap each other.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub single_activity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    #[serde(flatten)]
    pub tracking: Tracking,
}

impl Stream {
    /// Validate the structural invariants that do not need tree context:
    /// a creatable id and a non-empty name.
    pub fn validate_shape(&self) -> Result<(), ApiError> {
        if !self.id.is_valid_for_creation() {
            return Err(ApiError::invalid_operation(format!(
                "Stream id \"{}\" is reserved",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(ApiError::invalid_parameters_format(
                "Stream name must not be empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Node {
    stream: Stream,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// A user's stream forest as an arena of integer-indexed nodes.
///
/// Built once per request from the stored flat list (or served from the
/// per-user cache) and used by the permission evaluator and the
/// stream-query compiler for descendant expansion.
#[derive(Debug)]
pub struct StreamTree {
    nodes: Vec<Node>,
    index: HashMap<StreamId, usize>,
    roots: Vec<usize>,
}

impl StreamTree {
    /// Build a tree from a flat list of streams.
    ///
    /// A stream whose `parent_id` does not resolve is rejected, as is any
    /// cycle reachable via `parent_id` (both indicate store corruption;
    /// writes enforce these invariants up front).
    pub fn build(streams: Vec<Stream>) -> Result<Self, ApiError> {
        let mut index = HashMap::with_capacity(streams.len());
        for (i, s) in streams.iter().enumerate() {
            if index.insert(s.id.clone(), i).is_some() {
                return Err(ApiError::unexpected(format!(
                    "duplicate stream id \"{}\"",
                    s.id
                )));
            }
        }

        let mut nodes: Vec<Node> = streams
            .into_iter()
            .map(|stream| Node {
                stream,
                parent: None,
                children: Vec::new(),
            })
            .collect();

        let mut roots = Vec::new();
        for i in 0..nodes.len() {
            match nodes[i].stream.parent_id.clone() {
                None => roots.push(i),
                Some(pid) => {
                    let Some(&p) = index.get(&pid) else {
                        return Err(ApiError::unexpected(format!(
                            "stream \"{}\" references missing parent \"{pid}\"",
                            nodes[i].stream.id
                        )));
                    };
                    nodes[i].parent = Some(p);
                    nodes[p].children.push(i);
                }
            }
        }

        let tree = Self {
            nodes,
            index,
            roots,
        };
        tree.check_acyclic()?;
        Ok(tree)
    }

    fn check_acyclic(&self) -> Result<(), ApiError> {
        for start in 0..self.nodes.len() {
            let mut slow = start;
            let mut fast = start;
            loop {
                let Some(f1) = self.nodes[fast].parent else {
                    break;
                };
                let Some(f2) = self.nodes[f1].parent else {
                    break;
                };
                fast = f2;
                slow = self.nodes[slow].parent.expect("slow trails fast");
                if slow == fast {
                    return Err(ApiError::unexpected(format!(
                        "cycle through stream \"{}\"",
                        self.nodes[start].stream.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of streams in the forest.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a stream by id.
    #[must_use]
    pub fn get(&self, id: &StreamId) -> Option<&Stream> {
        self.index.get(id).map(|&i| &self.nodes[i].stream)
    }

    #[must_use]
    pub fn contains(&self, id: &StreamId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate over all streams in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.nodes.iter().map(|n| &n.stream)
    }

    /// The parent stream of `id`, if any.
    #[must_use]
    pub fn parent_of(&self, id: &StreamId) -> Option<&Stream> {
        let &i = self.index.get(id)?;
        self.nodes[i].parent.map(|p| &self.nodes[p].stream)
    }

    /// Direct children of `id`.
    #[must_use]
    pub fn children_of(&self, id: &StreamId) -> Vec<&Stream> {
        let Some(&i) = self.index.get(id) else {
            return Vec::new();
        };
        self.nodes[i]
            .children
            .iter()
            .map(|&c| &self.nodes[c].stream)
            .collect()
    }

    /// `id` plus all of its descendants, depth-first.
    ///
    /// Trashed descendants are skipped unless `include_trashed`; the root of
    /// the expansion is always included (an explicitly named trashed stream
    /// stays reachable).
    #[must_use]
    pub fn expand(&self, id: &StreamId, include_trashed: bool) -> Vec<StreamId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack = vec![(start, true)];
        while let Some((i, is_root)) = stack.pop() {
            let node = &self.nodes[i];
            if !is_root && node.stream.trashed && !include_trashed {
                continue;
            }
            out.push(node.stream.id.clone());
            for &c in node.children.iter().rev() {
                stack.push((c, false));
            }
        }
        out
    }

    /// Expand the `*` wildcard: every non-trashed top-level stream with its
    /// descendants.
    #[must_use]
    pub fn expand_star(&self, include_trashed: bool) -> Vec<StreamId> {
        let root_ids: Vec<StreamId> = self
            .roots
            .iter()
            .map(|&r| &self.nodes[r].stream)
            .filter(|s| include_trashed || !s.trashed)
            .map(|s| s.id.clone())
            .collect();
        let mut out = Vec::new();
        for id in &root_ids {
            out.extend(self.expand(id, include_trashed));
        }
        out
    }

    /// Whether `ancestor` equals `id` or lies on its parent chain.
    #[must_use]
    pub fn in_scope_of(&self, id: &StreamId, ancestor: &StreamId) -> bool {
        let Some(&start) = self.index.get(id) else {
            return false;
        };
        let mut i = Some(start);
        while let Some(cur) = i {
            if &self.nodes[cur].stream.id == ancestor {
                return true;
            }
            i = self.nodes[cur].parent;
        }
        false
    }

    /// Whether assigning `candidate_parent` as the parent of `id` would
    /// create a cycle (i.e. `candidate_parent` is `id` or a descendant).
    #[must_use]
    pub fn would_cycle(&self, id: &StreamId, candidate_parent: &StreamId) -> bool {
        self.in_scope_of(candidate_parent, id)
    }

    /// Whether a sibling of `parent_id` (root level when `None`) already
    /// carries `name`, ignoring `excluding` (used on rename).
    #[must_use]
    pub fn sibling_name_taken(
        &self,
        parent_id: Option<&StreamId>,
        name: &str,
        excluding: Option<&StreamId>,
    ) -> bool {
        let siblings: Vec<&Stream> = match parent_id {
            Some(pid) => self.children_of(pid),
            None => self.roots.iter().map(|&r| &self.nodes[r].stream).collect(),
        };
        siblings
            .iter()
            .any(|s| s.name == name && Some(&s.id) != excluding)
    }

    /// Serialize the forest (or the subtree under `parent_id`) as nested
    /// JSON objects with `children` arrays, depth-first.
    #[must_use]
    pub fn to_nested_json(&self, parent_id: Option<&StreamId>, include_trashed: bool) -> Vec<Value> {
        let indices: Vec<usize> = match parent_id {
            Some(pid) => match self.index.get(pid) {
                Some(&i) => self.nodes[i].children.clone(),
                None => Vec::new(),
            },
            None => self.roots.clone(),
        };
        indices
            .into_iter()
            .filter(|&i| include_trashed || !self.nodes[i].stream.trashed)
            .map(|i| self.node_to_json(i, include_trashed))
            .collect()
    }

    fn node_to_json(&self, i: usize, include_trashed: bool) -> Value {
        let node = &self.nodes[i];
        let mut obj = serde_json::to_value(&node.stream).expect("stream serializes");
        let children: Vec<Value> = node
            .children
            .iter()
            .filter(|&&c| include_trashed || !self.nodes[c].stream.trashed)
            .map(|&c| self.node_to_json(c, include_trashed))
            .collect();
        obj["children"] = Value::Array(children);
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessId;

    fn stream(id: &str, parent: Option<&str>) -> Stream {
        Stream {
            id: StreamId::from(id),
            name: id.to_owned(),
            parent_id: parent.map(StreamId::from),
            trashed: false,
            single_activity: false,
            client_data: None,
            tracking: Tracking::init(1.0, &AccessId::new("test")),
        }
    }

    fn sample_tree() -> StreamTree {
        // A > (B > E, C), D
        StreamTree::build(vec![
            stream("A", None),
            stream("B", Some("A")),
            stream("E", Some("B")),
            stream("C", Some("A")),
            stream("D", None),
        ])
        .unwrap()
    }

    #[test]
    fn expansion_includes_descendants() {
        let tree = sample_tree();
        let ids = tree.expand(&StreamId::from("A"), false);
        assert_eq!(
            ids,
            vec![
                StreamId::from("A"),
                StreamId::from("B"),
                StreamId::from("E"),
                StreamId::from("C"),
            ]
        );
    }

    #[test]
    fn expansion_skips_trashed_descendants_unless_asked() {
        let mut streams = vec![
            stream("A", None),
            stream("B", Some("A")),
            stream("E", Some("B")),
        ];
        streams[1].trashed = true;
        let tree = StreamTree::build(streams).unwrap();

        let ids = tree.expand(&StreamId::from("A"), false);
        assert_eq!(ids, vec![StreamId::from("A")]);

        let all = tree.expand(&StreamId::from("A"), true);
        assert_eq!(all.len(), 3);

        // Explicitly naming the trashed stream keeps it reachable.
        let named = tree.expand(&StreamId::from("B"), false);
        assert_eq!(named[0], StreamId::from("B"));
    }

    #[test]
    fn star_expansion_covers_forest() {
        let tree = sample_tree();
        let ids = tree.expand_star(false);
        assert_eq!(ids.len(), 5);
        assert!(ids.contains(&StreamId::from("D")));
    }

    #[test]
    fn missing_parent_is_rejected() {
        let err = StreamTree::build(vec![stream("B", Some("ghost"))]).unwrap_err();
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn cycle_is_rejected() {
        let streams = vec![stream("A", Some("B")), stream("B", Some("A"))];
        assert!(StreamTree::build(streams).is_err());
    }

    #[test]
    fn would_cycle_detects_descendant_parent() {
        let tree = sample_tree();
        assert!(tree.would_cycle(&StreamId::from("A"), &StreamId::from("E")));
        assert!(tree.would_cycle(&StreamId::from("A"), &StreamId::from("A")));
        assert!(!tree.would_cycle(&StreamId::from("B"), &StreamId::from("D")));
    }

    #[test]
    fn sibling_names_are_checked_per_parent() {
        let mut streams = vec![stream("A", None), stream("B", Some("A"))];
        streams[1].name = "journal".to_owned();
        let tree = StreamTree::build(streams).unwrap();
        assert!(tree.sibling_name_taken(Some(&StreamId::from("A")), "journal", None));
        assert!(!tree.sibling_name_taken(None, "journal", None));
        // Renaming B to its own name is not a collision.
        assert!(!tree.sibling_name_taken(
            Some(&StreamId::from("A")),
            "journal",
            Some(&StreamId::from("B"))
        ));
    }

    #[test]
    fn nested_serialization_is_depth_first() {
        let tree = sample_tree();
        let forest = tree.to_nested_json(None, false);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0]["id"], "A");
        assert_eq!(forest[0]["children"][0]["id"], "B");
        assert_eq!(forest[0]["children"][0]["children"][0]["id"], "E");
    }
}
