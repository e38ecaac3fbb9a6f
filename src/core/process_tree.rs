//! Canonical process forest
//!
//! The tree owns its nodes through `Arc`s held in the index and in each
//! parent's child list; a node only keeps a `Weak` pointer back to its
//! parent. Invariants checked by [`ProcessTree::validate`]:
//! - no cycles
//! - `level(child) == level(parent) + 1`
//! - roots have no parent reference
//!
//! Only the monitor's coordination task mutates the tree; readers take
//! [`TreeSnapshot`]s.

use crate::core::models::{ProcessRecord, ProcessState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessTreeError {
    #[error("Process tree validation failed: {0}")]
    Validation(String),
}

#[derive(Debug)]
pub struct ProcessNode {
    record: RwLock<ProcessRecord>,
    level: RwLock<usize>,
    parent: RwLock<Weak<ProcessNode>>,
    children: RwLock<Vec<Arc<ProcessNode>>>,
}

impl ProcessNode {
    fn new(record: ProcessRecord) -> Arc<Self> {
        Arc::new(Self {
            record: RwLock::new(record),
            level: RwLock::new(0),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn pid(&self) -> u32 {
        self.record.read().pid
    }

    pub fn record(&self) -> ProcessRecord {
        self.record.read().clone()
    }

    pub fn level(&self) -> usize {
        *self.level.read()
    }

    pub fn parent(&self) -> Option<Arc<ProcessNode>> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Vec<Arc<ProcessNode>> {
        self.children.read().clone()
    }
}

#[derive(Debug, Default)]
pub struct ProcessTree {
    nodes: HashMap<u32, Arc<ProcessNode>>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.nodes.contains_key(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<Arc<ProcessNode>> {
        self.nodes.get(&pid).cloned()
    }

    pub fn pids(&self) -> HashSet<u32> {
        self.nodes.keys().copied().collect()
    }

    pub fn roots(&self) -> Vec<Arc<ProcessNode>> {
        let mut roots: Vec<_> = self
            .nodes
            .values()
            .filter(|node| node.parent().is_none())
            .cloned()
            .collect();
        roots.sort_by_key(|node| node.pid());
        roots
    }

    /// Insert or refresh a record and repair parent/child edges.
    pub fn upsert(&mut self, record: ProcessRecord) {
        let pid = record.pid;
        let parent_pid = record.parent_pid;

        let node = match self.nodes.get(&pid) {
            Some(existing) => {
                *existing.record.write() = record;
                existing.clone()
            }
            None => {
                let node = ProcessNode::new(record);
                self.nodes.insert(pid, node.clone());
                node
            }
        };

        let current_parent = node.parent().map(|p| p.pid());
        let desired_parent = parent_pid
            .filter(|ppid| *ppid != pid)
            .and_then(|ppid| self.nodes.get(&ppid).cloned())
            .filter(|parent| !self.is_descendant(parent, pid));

        if current_parent != desired_parent.as_ref().map(|p| p.pid()) {
            self.detach(&node);
            if let Some(parent) = desired_parent {
                attach(&parent, &node);
            } else {
                set_level(&node, 0);
            }
        }

        // Adopt orphans that were observed before this parent.
        let orphans: Vec<Arc<ProcessNode>> = self
            .nodes
            .values()
            .filter(|candidate| {
                candidate.parent().is_none()
                    && candidate.pid() != pid
                    && candidate.record.read().parent_pid == Some(pid)
            })
            .cloned()
            .collect();
        for orphan in orphans {
            if !self.is_descendant(&node, orphan.pid()) {
                attach(&node, &orphan);
            }
        }
    }

    pub fn set_state(&mut self, pid: u32, state: ProcessState) -> bool {
        match self.nodes.get(&pid) {
            Some(node) => {
                node.record.write().state = state;
                true
            }
            None => false,
        }
    }

    /// Remove a process; its children become roots.
    pub fn remove(&mut self, pid: u32) -> Option<ProcessRecord> {
        let node = self.nodes.remove(&pid)?;
        self.detach(&node);
        let children = std::mem::take(&mut *node.children.write());
        for child in children {
            *child.parent.write() = Weak::new();
            set_level(&child, 0);
        }
        let record = node.record();
        Some(record)
    }

    /// All pids in the subtree rooted at `pid`, including `pid`.
    pub fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut result = Vec::new();
        if let Some(root) = self.nodes.get(&pid) {
            let mut stack = vec![root.clone()];
            while let Some(node) = stack.pop() {
                result.push(node.pid());
                stack.extend(node.children());
            }
        }
        result
    }

    pub fn validate(&self) -> Result<(), ProcessTreeError> {
        for (pid, node) in &self.nodes {
            if node.pid() != *pid {
                return Err(ProcessTreeError::Validation(format!(
                    "index key {} points at pid {}",
                    pid,
                    node.pid()
                )));
            }

            match node.parent() {
                None => {
                    if node.level() != 0 {
                        return Err(ProcessTreeError::Validation(format!(
                            "root {} has level {}",
                            pid,
                            node.level()
                        )));
                    }
                }
                Some(parent) => {
                    if node.level() != parent.level() + 1 {
                        return Err(ProcessTreeError::Validation(format!(
                            "pid {} level {} but parent {} level {}",
                            pid,
                            node.level(),
                            parent.pid(),
                            parent.level()
                        )));
                    }
                    if !parent.children.read().iter().any(|c| Arc::ptr_eq(c, node)) {
                        return Err(ProcessTreeError::Validation(format!(
                            "pid {} missing from parent {} child list",
                            pid,
                            parent.pid()
                        )));
                    }
                }
            }

            let mut seen = HashSet::new();
            let mut cursor = Some(node.clone());
            while let Some(current) = cursor {
                if !seen.insert(current.pid()) {
                    return Err(ProcessTreeError::Validation(format!(
                        "cycle detected through pid {}",
                        pid
                    )));
                }
                cursor = current.parent();
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        let nodes = self
            .nodes
            .values()
            .map(|node| {
                let mut children: Vec<u32> = node.children().iter().map(|c| c.pid()).collect();
                children.sort_unstable();
                (
                    node.pid(),
                    TreeNodeView {
                        record: node.record(),
                        level: node.level(),
                        parent: node.parent().map(|p| p.pid()),
                        children,
                    },
                )
            })
            .collect();
        let roots = self.roots().iter().map(|r| r.pid()).collect();
        TreeSnapshot { roots, nodes }
    }

    fn is_descendant(&self, candidate: &Arc<ProcessNode>, ancestor_pid: u32) -> bool {
        let mut cursor = Some(candidate.clone());
        while let Some(node) = cursor {
            if node.pid() == ancestor_pid {
                return true;
            }
            cursor = node.parent();
        }
        false
    }

    fn detach(&self, node: &Arc<ProcessNode>) {
        if let Some(parent) = node.parent() {
            parent.children.write().retain(|c| !Arc::ptr_eq(c, node));
        }
        *node.parent.write() = Weak::new();
    }
}

fn attach(parent: &Arc<ProcessNode>, child: &Arc<ProcessNode>) {
    *child.parent.write() = Arc::downgrade(parent);
    parent.children.write().push(child.clone());
    set_level(child, parent.level() + 1);
}

fn set_level(node: &Arc<ProcessNode>, level: usize) {
    let mut stack = vec![(node.clone(), level)];
    while let Some((current, lvl)) = stack.pop() {
        *current.level.write() = lvl;
        for child in current.children() {
            stack.push((child, lvl + 1));
        }
    }
}

/// Owned, serializable view of the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub roots: Vec<u32>,
    pub nodes: BTreeMap<u32, TreeNodeView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNodeView {
    pub record: ProcessRecord,
    pub level: usize,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
}

impl TreeSnapshot {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.nodes.contains_key(&pid)
    }

    pub fn level(&self, pid: u32) -> Option<usize> {
        self.nodes.get(&pid).map(|n| n.level)
    }
}
