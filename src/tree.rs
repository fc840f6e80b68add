// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Arena owning every node of the agent hierarchy.
//!
//! Parents own their children by id; a child only keeps its parent's id for
//! lookup. Removing a node removes its whole subtree.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[cfg(feature = "telemetry")]
use tracing::debug;

use crate::agent::{AgentId, AgentNode, AgentRole, AgentSnapshot};
use crate::error::FsError;
use crate::workspace::{self, FileKind, FileSystem};

/// File a manager maintains through UPDATE_README. Never gets a coder.
pub const README_FILE: &str = "README.md";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Path already owned by another agent: {0}")]
    PathConflict(PathBuf),

    #[error("{path} is not a direct child of {parent}")]
    NotADirectChild { parent: PathBuf, path: PathBuf },

    #[error("{0} cannot own children")]
    CannotOwnChildren(AgentId),

    #[error("{0} is not an ephemeral tester")]
    NotEphemeral(AgentId),

    #[error("The root agent cannot be removed")]
    CannotRemoveRoot,

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// The agent hierarchy.
#[derive(Debug)]
pub struct AgentTree {
    nodes: HashMap<AgentId, AgentNode>,
    by_path: HashMap<PathBuf, AgentId>,
    root: AgentId,
    next_id: u32,
    context_capacity: usize,
}

impl AgentTree {
    /// Create a tree holding only an inactive Master at the project root.
    pub fn new(context_capacity: usize) -> Self {
        let root = AgentId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            AgentNode::new(root, AgentRole::Master, PathBuf::new(), None, context_capacity),
        );
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), root);

        Self {
            nodes,
            by_path,
            root,
            next_id: 2,
            context_capacity,
        }
    }

    pub fn root(&self) -> AgentId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut AgentNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: AgentId) -> Result<&AgentNode, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::UnknownAgent(id))
    }

    pub fn node_mut(&mut self, id: AgentId) -> Result<&mut AgentNode, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::UnknownAgent(id))
    }

    /// Persistent node owning `path`. Testers are never indexed by path.
    pub fn by_path(&self, path: &Path) -> Option<AgentId> {
        self.by_path.get(path).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.nodes.keys().copied()
    }

    fn allocate_id(&mut self) -> AgentId {
        let id = AgentId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Attach a new persistent node for `path` below `parent`.
    pub fn add_child(
        &mut self,
        parent: AgentId,
        role: AgentRole,
        path: impl Into<PathBuf>,
    ) -> Result<AgentId, TreeError> {
        let path = path.into();
        let parent_node = self.node(parent)?;
        if !parent_node.capabilities().can_delegate {
            return Err(TreeError::CannotOwnChildren(parent));
        }
        if path.parent() != Some(parent_node.scope_path()) || path.as_os_str().is_empty() {
            return Err(TreeError::NotADirectChild {
                parent: parent_node.scope_path().to_path_buf(),
                path,
            });
        }
        if self.by_path.contains_key(&path) {
            return Err(TreeError::PathConflict(path));
        }

        let id = self.allocate_id();
        let node = AgentNode::new(id, role, path.clone(), Some(parent), self.context_capacity);
        self.nodes.insert(id, node);
        self.by_path.insert(path.clone(), id);
        self.node_mut(parent)?.children.push(id);

        #[cfg(feature = "telemetry")]
        debug!(agent = %id, role = %role, path = %path.display(), "Node added");

        Ok(id)
    }

    /// Make sure a node exists for `path`, creating missing ancestor managers.
    ///
    /// Directories get a Manager, files a Coder.
    pub fn ensure_node(&mut self, path: &Path, kind: FileKind) -> Result<AgentId, TreeError> {
        if let Some(id) = self.by_path(path) {
            return Ok(id);
        }

        let mut parent = self.root;
        let mut current = PathBuf::new();
        let components: Vec<_> = path.components().collect();
        for (index, component) in components.iter().enumerate() {
            current.push(component);
            let is_last = index + 1 == components.len();
            parent = match self.by_path(&current) {
                Some(id) => id,
                None => {
                    let role = if is_last && kind == FileKind::File {
                        AgentRole::Coder
                    } else {
                        AgentRole::Manager
                    };
                    self.add_child(parent, role, current.clone())?
                }
            };
        }
        Ok(parent)
    }

    /// Direct-child path `target` resolves to under `parent`'s scope.
    ///
    /// `target` may be relative to the scope or project-relative.
    pub fn resolve_child(&self, parent: AgentId, target: &Path) -> Option<PathBuf> {
        let scope = self.get(parent)?.scope_path();
        if target.parent() == Some(scope) {
            return Some(target.to_path_buf());
        }
        let joined = scope.join(target);
        (joined.parent() == Some(scope)).then_some(joined)
    }

    /// Remove `id` and everything below it. Returns the removed ids, `id` first.
    pub fn remove_subtree(&mut self, id: AgentId) -> Result<Vec<AgentId>, TreeError> {
        if id == self.root {
            return Err(TreeError::CannotRemoveRoot);
        }
        let parent = self.node(id)?.parent();

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                if node.role() != AgentRole::Tester {
                    self.by_path.remove(node.scope_path());
                }
                stack.extend(node.children().iter().rev().copied());
                removed.push(next);
            }
        }

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Ok(removed)
    }

    /// Attach a short-lived tester under `parent`, sharing its scope.
    pub fn spawn_ephemeral(&mut self, parent: AgentId) -> Result<AgentId, TreeError> {
        let scope = self.node(parent)?.scope_path().to_path_buf();
        let id = self.allocate_id();
        self.nodes.insert(
            id,
            AgentNode::new(id, AgentRole::Tester, scope, Some(parent), self.context_capacity),
        );
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Remove a tester created by [`spawn_ephemeral`](Self::spawn_ephemeral).
    pub fn dismiss_ephemeral(&mut self, id: AgentId) -> Result<(), TreeError> {
        if !self.node(id)?.capabilities().is_ephemeral {
            return Err(TreeError::NotEphemeral(id));
        }
        self.remove_subtree(id).map(|_| ())
    }

    /// Whether any persistent node at or below `path` is not `Inactive`.
    pub fn scope_busy(&self, path: &Path) -> bool {
        self.nodes.values().any(|node| {
            node.role() != AgentRole::Tester
                && node.scope_path().starts_with(path)
                && node.state().is_busy()
        })
    }

    /// Mirror the file system: a Manager per directory and a Coder per file.
    ///
    /// Hidden entries and directory READMEs are skipped. Returns the number of
    /// nodes created.
    pub async fn populate_from_fs(&mut self, fs: &dyn FileSystem) -> Result<usize, TreeError> {
        let before = self.nodes.len();
        for entry in workspace::walk(fs, Path::new("")).await? {
            if entry.kind == FileKind::File && entry.name() == README_FILE {
                continue;
            }
            self.ensure_node(&entry.path, entry.kind)?;
        }
        let created = self.nodes.len() - before;

        #[cfg(feature = "telemetry")]
        debug!(created, total = self.nodes.len(), "Tree populated from file system");

        Ok(created)
    }

    /// Depth-first ids starting at the root, children in insertion order.
    pub fn dfs(&self) -> Vec<AgentId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(id);
                stack.extend(node.children().iter().rev().copied());
            }
        }
        out
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.dfs()
            .into_iter()
            .filter_map(|id| self.get(id).map(AgentNode::snapshot))
            .collect()
    }

    /// Sorted paths owned by coders.
    pub fn coder_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .nodes
            .values()
            .filter(|n| n.role() == AgentRole::Coder)
            .map(|n| n.scope_path().to_path_buf())
            .collect();
        paths.sort();
        paths
    }

    /// Indented, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let label = if node.scope_path().as_os_str().is_empty() {
                ".".to_string()
            } else {
                node.scope_path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            };
            let _ = writeln!(
                out,
                "{}{} ({}, {}) [{}]",
                "  ".repeat(depth),
                label,
                node.role(),
                id,
                node.state()
            );
            for child in node.children().iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LifecycleState;
    use crate::message::TaskMessage;
    use crate::workspace::MemoryFileSystem;
    use std::collections::BTreeMap;

    #[test]
    fn test_new_tree_has_inactive_master() {
        let tree = AgentTree::new(8);
        let root = tree.node(tree.root()).unwrap();
        assert_eq!(root.role(), AgentRole::Master);
        assert_eq!(root.state(), LifecycleState::Inactive);
        assert_eq!(tree.by_path(Path::new("")), Some(tree.root()));
    }

    #[test]
    fn test_add_child_rules() {
        let mut tree = AgentTree::new(8);
        let src = tree.add_child(tree.root(), AgentRole::Manager, "src").unwrap();
        let lib = tree.add_child(src, AgentRole::Coder, "src/lib.py").unwrap();

        assert_eq!(
            tree.add_child(src, AgentRole::Coder, "src/lib.py"),
            Err(TreeError::PathConflict(PathBuf::from("src/lib.py")))
        );
        assert!(matches!(
            tree.add_child(src, AgentRole::Coder, "docs/a.md"),
            Err(TreeError::NotADirectChild { .. })
        ));
        assert_eq!(
            tree.add_child(lib, AgentRole::Coder, "src/lib.py/x"),
            Err(TreeError::CannotOwnChildren(lib))
        );
        assert_eq!(tree.node(lib).unwrap().parent(), Some(src));
    }

    #[test]
    fn test_ensure_node_creates_ancestors() {
        let mut tree = AgentTree::new(8);
        let id = tree.ensure_node(Path::new("pkg/util/strings.py"), FileKind::File).unwrap();

        let pkg = tree.by_path(Path::new("pkg")).unwrap();
        let util = tree.by_path(Path::new("pkg/util")).unwrap();
        assert_eq!(tree.node(pkg).unwrap().role(), AgentRole::Manager);
        assert_eq!(tree.node(util).unwrap().role(), AgentRole::Manager);
        assert_eq!(tree.node(id).unwrap().role(), AgentRole::Coder);
        assert_eq!(tree.node(id).unwrap().parent(), Some(util));

        // Idempotent.
        assert_eq!(tree.ensure_node(Path::new("pkg/util/strings.py"), FileKind::File), Ok(id));
    }

    #[test]
    fn test_resolve_child() {
        let mut tree = AgentTree::new(8);
        let src = tree.add_child(tree.root(), AgentRole::Manager, "src").unwrap();

        assert_eq!(tree.resolve_child(src, Path::new("a.py")), Some(PathBuf::from("src/a.py")));
        assert_eq!(tree.resolve_child(src, Path::new("src/a.py")), Some(PathBuf::from("src/a.py")));
        assert_eq!(tree.resolve_child(src, Path::new("deep/a.py")), None);
        assert_eq!(tree.resolve_child(tree.root(), Path::new("src")), Some(PathBuf::from("src")));
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = AgentTree::new(8);
        let leaf = tree.ensure_node(Path::new("a/b/c.py"), FileKind::File).unwrap();
        let a = tree.by_path(Path::new("a")).unwrap();

        let removed = tree.remove_subtree(a).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0], a);
        assert!(tree.get(leaf).is_none());
        assert!(tree.by_path(Path::new("a/b")).is_none());
        assert!(tree.node(tree.root()).unwrap().children().is_empty());
        assert_eq!(tree.remove_subtree(tree.root()), Err(TreeError::CannotRemoveRoot));
    }

    #[test]
    fn test_ephemeral_tester_is_dismissed() {
        let mut tree = AgentTree::new(8);
        let src = tree.add_child(tree.root(), AgentRole::Manager, "src").unwrap();
        let tester = tree.spawn_ephemeral(src).unwrap();

        assert_eq!(tree.node(tester).unwrap().role(), AgentRole::Tester);
        assert!(tree.node(src).unwrap().children().contains(&tester));
        assert_eq!(tree.by_path(Path::new("src")), Some(src));

        assert_eq!(tree.dismiss_ephemeral(src), Err(TreeError::NotEphemeral(src)));
        tree.dismiss_ephemeral(tester).unwrap();
        assert!(tree.node(src).unwrap().children().is_empty());
    }

    #[test]
    fn test_scope_busy() {
        let mut tree = AgentTree::new(8);
        let file = tree.ensure_node(Path::new("src/a.py"), FileKind::File).unwrap();
        assert!(!tree.scope_busy(Path::new("src")));

        let task = TaskMessage::new(AgentId(1), file, "write");
        tree.node_mut(file).unwrap().activate(task, BTreeMap::new()).unwrap();
        assert!(tree.scope_busy(Path::new("src")));
        assert!(tree.scope_busy(Path::new("src/a.py")));
        assert!(!tree.scope_busy(Path::new("src/b.py")));
    }

    #[tokio::test]
    async fn test_populate_from_fs() {
        let fs = MemoryFileSystem::with_files([
            ("README.md", "# demo"),
            ("src/calc.py", ""),
            ("src/README.md", "calc"),
            ("src/test_calc.py", ""),
            (".git/HEAD", "ref"),
        ]);
        let mut tree = AgentTree::new(8);
        let created = tree.populate_from_fs(&fs).await.unwrap();

        assert_eq!(created, 3);
        assert_eq!(
            tree.coder_paths(),
            vec![PathBuf::from("src/calc.py"), PathBuf::from("src/test_calc.py")]
        );
        assert!(tree.by_path(Path::new(".git")).is_none());
        assert!(tree.by_path(Path::new("README.md")).is_none());
    }

    #[test]
    fn test_snapshot_is_depth_first() {
        let mut tree = AgentTree::new(8);
        tree.ensure_node(Path::new("a/x.py"), FileKind::File).unwrap();
        tree.ensure_node(Path::new("b"), FileKind::Directory).unwrap();

        let paths: Vec<PathBuf> = tree.snapshot().into_iter().map(|s| s.path).collect();
        assert_eq!(
            paths,
            vec![PathBuf::new(), PathBuf::from("a"), PathBuf::from("a/x.py"), PathBuf::from("b")]
        );

        let rendered = tree.render();
        assert!(rendered.starts_with(". (master, agent-1) [inactive]"));
        assert!(rendered.contains("    x.py (coder"));
    }
}
