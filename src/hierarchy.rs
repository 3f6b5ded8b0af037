//! The referral tree as an arena of user nodes keyed by id.
//!
//! Parent links are plain ids, so every walk is bounded and cycle checks are
//! set lookups rather than pointer chasing.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::info;

use crate::error::IncomeError;
use crate::store::{Store, max_chain_depth_key};
use crate::types::{NewUser, UserId, UserNode};

/// Default hard bound on ancestor walks.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
pub struct Hierarchy {
    nodes: HashMap<UserId, UserNode>,
    children: HashMap<UserId, Vec<UserId>>,
    max_depth: usize,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TREE_DEPTH)
    }
}

impl Hierarchy {
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            max_depth,
        }
    }

    /// Builds the arena from stored rows without validating parent links.
    /// Broken links surface later as walk errors.
    pub fn from_nodes(nodes: impl IntoIterator<Item = UserNode>, max_depth: usize) -> Self {
        let mut hierarchy = Self::new(max_depth);
        for node in nodes {
            hierarchy.link(node);
        }
        hierarchy
    }

    /// Adds a newly registered user. The parent must already exist.
    pub fn insert(&mut self, node: UserNode) -> Result<(), IncomeError> {
        if self.nodes.contains_key(&node.id) {
            return Err(IncomeError::DuplicateUser(node.id));
        }
        if let Some(parent_id) = node.parent_id {
            if parent_id == node.id || !self.nodes.contains_key(&parent_id) {
                return Err(IncomeError::UnknownParent {
                    user_id: node.id,
                    parent_id,
                });
            }
        }
        self.link(node);
        Ok(())
    }

    fn link(&mut self, node: UserNode) {
        if let Some(parent_id) = node.parent_id {
            self.children.entry(parent_id).or_default().push(node.id);
        }
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: UserId) -> Option<&UserNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn next_id(&self) -> UserId {
        self.nodes.keys().max().map_or(1, |id| id + 1)
    }

    /// Returns up to `limit` ancestors of `id`, nearest first.
    ///
    /// An unknown user has no ancestors. Revisiting a node or walking past the
    /// arena's depth bound is reported as [`IncomeError::CycleDetected`].
    pub fn ancestor_chain(&self, id: UserId, limit: usize) -> Result<Vec<UserId>, IncomeError> {
        let Some(mut cursor) = self.nodes.get(&id) else {
            return Ok(Vec::new());
        };

        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        while let Some(parent_id) = cursor.parent_id {
            if chain.len() >= limit {
                break;
            }
            if chain.len() >= self.max_depth || !seen.insert(parent_id) {
                return Err(IncomeError::CycleDetected {
                    user_id: id,
                    bound: self.max_depth,
                });
            }
            cursor = self
                .nodes
                .get(&parent_id)
                .ok_or(IncomeError::UnknownParent {
                    user_id: cursor.id,
                    parent_id,
                })?;
            chain.push(parent_id);
        }
        Ok(chain)
    }

    /// Distance from `id` to its root; roots are at depth 0.
    pub fn depth(&self, id: UserId) -> Result<Option<usize>, IncomeError> {
        if !self.contains(id) {
            return Ok(None);
        }
        Ok(Some(self.ancestor_chain(id, usize::MAX)?.len()))
    }

    /// `id` and all of its descendants. Empty when `id` is unknown.
    pub fn subtree(&self, id: UserId) -> HashSet<UserId> {
        let mut members = HashSet::new();
        if !self.contains(id) {
            return members;
        }

        let mut queue = VecDeque::from([id]);
        members.insert(id);
        while let Some(current) = queue.pop_front() {
            for &child in self.children.get(&current).into_iter().flatten() {
                if members.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        members
    }
}

/// Registers a user under an optional recruiter.
///
/// When `max_chain_depth.<role>` is configured, the new user's depth may not
/// exceed it.
pub async fn register_user(store: &dyn Store, user: NewUser) -> Result<UserNode, IncomeError> {
    if let Some(parent_id) = user.parent_id {
        let depth = store
            .depth(parent_id)
            .await?
            .ok_or(IncomeError::UserNotFound(parent_id))?;
        let limit = store
            .setting(&max_chain_depth_key(user.role))
            .await?
            .and_then(|value| value.trim().parse::<usize>().ok());
        if let Some(max_depth) = limit {
            if depth + 1 > max_depth {
                return Err(IncomeError::DepthLimitExceeded {
                    parent_id,
                    max_depth,
                });
            }
        }
    }

    let node = store.insert_user(user).await?;
    info!(user_id = node.id, role = %node.role, parent_id = ?node.parent_id, "user registered");
    Ok(node)
}
