//! The forest of VHD trees for one SR, rebuilt from every scan. Nodes are
//! kept in a UUID-keyed map; parent/child references are UUIDs, never
//! owning pointers.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::vdi::Vdi;

const TREE_INDENT: usize = 4;

#[derive(Debug, Default)]
pub struct Forest {
    vdis: BTreeMap<String, Vdi>,
}

impl Forest {
    /// Rebuild the forest from freshly scanned nodes. Every non-empty
    /// parent reference must resolve to a present node; an unresolved
    /// parent aborts the build unless the orphan is interrupted-coalesce
    /// residue (which becomes an extra root) or `force` is set.
    pub fn build(mut nodes: BTreeMap<String, Vdi>, force: bool) -> Result<Forest> {
        let uuids: Vec<String> = nodes.keys().cloned().collect();
        for v in nodes.values_mut() {
            v.children.clear();
        }
        for uuid in &uuids {
            let Some(parent_uuid) = nodes[uuid].parent_uuid.clone() else {
                continue;
            };
            if !nodes.contains_key(&parent_uuid) {
                if nodes[uuid].is_rename_residue() {
                    continue;
                }
                if force {
                    tracing::error!("parent {parent_uuid} of {uuid} not found, keeping as root");
                    continue;
                }
                anyhow::bail!("parent {parent_uuid} of {uuid} not found");
            }
            let parent = nodes.get_mut(&parent_uuid).unwrap();
            parent.children.push(uuid.clone());
        }
        Ok(Forest { vdis: nodes })
    }

    pub fn len(&self) -> usize {
        self.vdis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vdis.is_empty()
    }

    pub fn get(&self, uuid: &str) -> Option<&Vdi> {
        self.vdis.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Vdi> {
        self.vdis.get_mut(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vdi> {
        self.vdis.values()
    }

    /// A node is a root if it has no parent reference or the reference does
    /// not resolve (rename residue / forced scan).
    fn is_root(&self, v: &Vdi) -> bool {
        match &v.parent_uuid {
            None => true,
            Some(p) => !self.vdis.contains_key(p),
        }
    }

    pub fn roots(&self) -> Vec<&Vdi> {
        self.vdis.values().filter(|v| self.is_root(v)).collect()
    }

    pub fn parent(&self, uuid: &str) -> Option<&Vdi> {
        let v = self.vdis.get(uuid)?;
        v.parent_uuid.as_deref().and_then(|p| self.vdis.get(p))
    }

    /// Root of the tree `uuid` belongs to.
    pub fn tree_root<'a>(&'a self, uuid: &'a str) -> &'a str {
        let mut cur = uuid;
        while let Some(p) = self.parent(cur) {
            cur = &p.uuid;
        }
        cur
    }

    /// Height of the subtree rooted at `uuid`.
    pub fn height(&self, uuid: &str) -> usize {
        let Some(v) = self.vdis.get(uuid) else {
            return 0;
        };
        1 + v
            .children
            .iter()
            .map(|c| self.height(c))
            .max()
            .unwrap_or(0)
    }

    /// `uuid` and all its descendants, parents before children.
    pub fn subtree(&self, uuid: &str) -> Vec<String> {
        let mut r = Vec::new();
        let mut stack = vec![uuid.to_string()];
        while let Some(u) = stack.pop() {
            if let Some(v) = self.vdis.get(&u) {
                stack.extend(v.children.iter().cloned());
            }
            r.push(u);
        }
        r
    }

    /// Leaf nodes of the subtree rooted at `uuid`.
    pub fn leaves(&self, uuid: &str) -> Vec<String> {
        self.subtree(uuid)
            .into_iter()
            .filter(|u| self.vdis.get(u).is_some_and(|v| v.is_leaf()))
            .collect()
    }

    /// All garbage nodes, descendants before ancestors so they can be
    /// deleted in order. A hidden leaf is garbage unless a pending relink
    /// journal shows it was just coalesced and its children may still be
    /// reloading; an inner node is garbage if every descendant is.
    pub fn prunable(&self, has_relink_journal: &dyn Fn(&str) -> bool) -> Vec<String> {
        let mut r = Vec::new();
        for root in self.roots() {
            self.prunable_in(&root.uuid, has_relink_journal, &mut r);
        }
        r
    }

    fn prunable_in(
        &self,
        uuid: &str,
        has_relink_journal: &dyn Fn(&str) -> bool,
        out: &mut Vec<String>,
    ) -> bool {
        let v = &self.vdis[uuid];
        if v.is_leaf() {
            if !v.scan_error && v.hidden && !has_relink_journal(uuid) {
                out.push(uuid.to_string());
                return true;
            }
            return false;
        }
        let mut all_children_prunable = true;
        for c in &v.children {
            if !self.prunable_in(c, has_relink_journal, out) {
                all_children_prunable = false;
            }
        }
        if all_children_prunable && !v.scan_error && v.hidden {
            out.push(uuid.to_string());
            return true;
        }
        false
    }

    /// A hidden non-leaf whose parent has no other child can be coalesced
    /// into that parent.
    pub fn is_coalesceable(&self, uuid: &str) -> bool {
        let Some(v) = self.vdis.get(uuid) else {
            return false;
        };
        let Some(parent) = self.parent(uuid) else {
            return false;
        };
        !v.scan_error && parent.children.len() == 1 && v.hidden && !v.is_leaf()
    }

    /// A visible leaf whose parent has no other child can take over its
    /// parent's identity.
    pub fn is_leaf_coalesceable(&self, uuid: &str) -> bool {
        let Some(v) = self.vdis.get(uuid) else {
            return false;
        };
        let Some(parent) = self.parent(uuid) else {
            return false;
        };
        !v.scan_error && parent.children.len() == 1 && !v.hidden && v.is_leaf()
    }

    /// Re-point `child` at `new_parent` (map-level only; the on-disk parent
    /// pointer is the caller's business).
    pub fn set_parent(&mut self, child: &str, new_parent: &str) {
        let old = self.vdis[child].parent_uuid.clone();
        if let Some(old) = old {
            if let Some(p) = self.vdis.get_mut(&old) {
                p.children.retain(|c| c != child);
            }
        }
        self.vdis.get_mut(child).unwrap().parent_uuid = Some(new_parent.to_string());
        let np = self.vdis.get_mut(new_parent).unwrap();
        if !np.children.iter().any(|c| c == child) {
            np.children.push(child.to_string());
        }
    }

    /// Remove a childless node from the forest, detaching it from its
    /// parent, and hand it back.
    pub fn detach(&mut self, uuid: &str) -> Vdi {
        let v = self.vdis.remove(uuid).unwrap();
        assert!(v.children.is_empty(), "detaching {uuid} with children");
        if let Some(p) = v.parent_uuid.as_deref().and_then(|p| self.vdis.get_mut(p)) {
            p.children.retain(|c| c != uuid);
        }
        v
    }

    /// Re-key a node under a new uuid. The parent's child list and the
    /// children of the node are left for the caller to fix up, mirroring
    /// the identity swap in a leaf-coalesce.
    pub fn rename(&mut self, old_uuid: &str, new_uuid: &str) {
        assert!(!self.vdis.contains_key(new_uuid));
        let mut v = self.vdis.remove(old_uuid).unwrap();
        v.uuid = new_uuid.to_string();
        v.children.clear();
        self.vdis.insert(new_uuid.to_string(), v);
    }

    fn tree_string(&self, uuid: &str, indent: usize, out: &mut String) {
        let v = &self.vdis[uuid];
        out.push_str(&" ".repeat(indent));
        out.push_str(&v.to_string());
        out.push('\n');
        for c in &v.children {
            self.tree_string(c, indent + TREE_INDENT, out);
        }
    }

    /// Render one tree, for the change-filtered state log.
    pub fn render_tree(&self, root_uuid: &str) -> String {
        let mut s = String::new();
        self.tree_string(root_uuid, 8, &mut s);
        s
    }
}

/// Logs the forest state after each scan, printing only trees that changed
/// since the previous log to keep the output readable over long runs.
#[derive(Debug, Default)]
pub struct TreeLogFilter {
    prev: BTreeMap<String, String>,
    state_logged: bool,
}

impl TreeLogFilter {
    pub fn log_state(&mut self, forest: &Forest) {
        let mut cur = BTreeMap::new();
        let mut changes = String::new();
        for root in forest.roots() {
            let s = forest.render_tree(&root.uuid);
            if self.prev.get(&root.uuid) != Some(&s) {
                changes.push_str(&s);
            }
            cur.insert(root.uuid.clone(), s);
        }
        for uuid in self.prev.keys() {
            if !cur.contains_key(uuid) {
                changes.push_str(&format!("tree {uuid} gone\n"));
            }
        }
        let ntrees = cur.len();
        let nvdis = forest.len();
        if changes.is_empty() {
            tracing::info!("SR state ({nvdis} VDIs in {ntrees} VHD trees): no changes");
        } else {
            let only = if self.state_logged {
                " (showing only VHD trees that changed)"
            } else {
                ""
            };
            tracing::info!("SR state ({nvdis} VDIs in {ntrees} VHD trees){only}:");
            for line in changes.lines() {
                tracing::info!("{line}");
            }
        }
        self.prev = cur;
        self.state_logged = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uuid: &str, parent: Option<&str>, hidden: bool) -> Vdi {
        Vdi {
            uuid: uuid.to_string(),
            parent_uuid: parent.map(|p| p.to_string()),
            hidden,
            size_virt: 1024,
            ..Default::default()
        }
    }

    fn forest(nodes: Vec<Vdi>) -> Forest {
        let map = nodes.into_iter().map(|n| (n.uuid.clone(), n)).collect();
        Forest::build(map, false).unwrap()
    }

    // R -> A -> B, plus lone root L
    fn sample() -> Forest {
        forest(vec![
            node("rrrr", None, true),
            node("aaaa", Some("rrrr"), true),
            node("bbbb", Some("aaaa"), false),
            node("llll", None, false),
        ])
    }

    #[test]
    fn test_build_links_children() {
        let f = sample();
        assert_eq!(f.len(), 4);
        // every node with a parent appears exactly once in that parent's
        // child list
        for v in f.iter() {
            if let Some(p) = f.parent(&v.uuid) {
                assert_eq!(p.children.iter().filter(|c| *c == &v.uuid).count(), 1);
            }
        }
        assert_eq!(f.roots().len(), 2);
        assert_eq!(f.tree_root("bbbb"), "rrrr");
        assert_eq!(f.height("rrrr"), 3);
        assert_eq!(f.height("aaaa"), 2);
        assert_eq!(f.leaves("rrrr"), vec!["bbbb".to_string()]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = sample();
        let b = sample();
        for v in a.iter() {
            let w = b.get(&v.uuid).unwrap();
            assert_eq!(v.children, w.children);
            assert_eq!(v.parent_uuid, w.parent_uuid);
        }
    }

    #[test]
    fn test_missing_parent() {
        let nodes: BTreeMap<_, _> = [node("cccc", Some("gone"), false)]
            .into_iter()
            .map(|n| (n.uuid.clone(), n))
            .collect();
        assert!(Forest::build(nodes.clone(), false).is_err());
        // forced scan keeps the orphan as a root
        let f = Forest::build(nodes, true).unwrap();
        assert_eq!(f.roots().len(), 1);
        // rename residue is tolerated without force
        let residue = node("OLD_cccc", Some("gone"), true);
        let map = [(residue.uuid.clone(), residue)].into_iter().collect();
        let f = Forest::build(map, false).unwrap();
        assert_eq!(f.roots().len(), 1);
    }

    #[test]
    fn test_raw_parent_allowed() {
        // a raw base image can head a chain (LV back-end)
        let mut r = node("rrrr", None, false);
        r.raw = true;
        let c = node("cccc", Some("rrrr"), false);
        let map = [r, c].into_iter().map(|n| (n.uuid.clone(), n)).collect();
        let f = Forest::build(map, false).unwrap();
        assert!(f.is_leaf_coalesceable("cccc"));
    }

    #[test]
    fn test_prunable_whole_chain() {
        // R(hidden) -> A(hidden) -> B(hidden): all garbage, bottom-up
        let f = forest(vec![
            node("rrrr", None, true),
            node("aaaa", Some("rrrr"), true),
            node("bbbb", Some("aaaa"), true),
        ]);
        let p = f.prunable(&|_| false);
        assert_eq!(p, vec!["bbbb".to_string(), "aaaa".into(), "rrrr".into()]);
    }

    #[test]
    fn test_prunable_respects_relink_journal_and_visibility() {
        let f = sample();
        // bbbb is visible, so nothing above it is prunable
        assert!(f.prunable(&|_| false).is_empty());

        let f = forest(vec![node("hhhh", None, true)]);
        assert_eq!(f.prunable(&|_| false), vec!["hhhh".to_string()]);
        // a pending relink journal protects a freshly coalesced leaf
        assert!(f.prunable(&|u| u == "hhhh").is_empty());
    }

    #[test]
    fn test_candidate_predicates_disjoint() {
        let f = forest(vec![
            node("rrrr", None, true),
            node("aaaa", Some("rrrr"), true),
            node("bbbb", Some("aaaa"), false),
        ]);
        // aaaa: hidden intermediate with sole-child parent
        assert!(f.is_coalesceable("aaaa"));
        assert!(!f.is_leaf_coalesceable("aaaa"));
        // bbbb: visible leaf with sole-child parent
        assert!(f.is_leaf_coalesceable("bbbb"));
        assert!(!f.is_coalesceable("bbbb"));
        // the root is neither
        assert!(!f.is_coalesceable("rrrr"));
        assert!(!f.is_leaf_coalesceable("rrrr"));
        let garbage = f.prunable(&|_| false);
        assert!(garbage.is_empty());
    }

    #[test]
    fn test_set_parent_and_detach() {
        let mut f = forest(vec![
            node("pppp", None, true),
            node("cccc", Some("pppp"), true),
            node("gggg", Some("cccc"), false),
        ]);
        // relink grandchild to grandparent, then drop the middle node
        f.set_parent("gggg", "pppp");
        assert!(f.get("cccc").unwrap().children.is_empty());
        assert_eq!(f.parent("gggg").unwrap().uuid, "pppp");
        let dropped = f.detach("cccc");
        assert_eq!(dropped.uuid, "cccc");
        assert_eq!(f.len(), 2);
        assert_eq!(
            f.get("pppp").unwrap().children,
            vec!["gggg".to_string()]
        );
    }

    #[test]
    fn test_rename_identity() {
        let mut f = forest(vec![node("pppp", None, false)]);
        f.rename("pppp", "OLD_pppp");
        assert!(f.get("pppp").is_none());
        f.rename("OLD_pppp", "pppp");
        assert_eq!(f.get("pppp").unwrap().uuid, "pppp");
    }
}
