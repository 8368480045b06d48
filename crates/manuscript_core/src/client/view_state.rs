//! Serializable UI view state for the document tree.
//!
//! Passed explicitly into tree rendering and client operations instead of
//! living in ambient globals.

use crate::model::document::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Dismissable notice shown after a reverted mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Title of the document the failed mutation targeted.
    pub document_title: String,
    pub message: String,
}

/// Expansion, focus and pending notices of one tree view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    expanded: BTreeSet<NodeId>,
    focused: Option<NodeId>,
    notices: Vec<Notice>,
}

impl ViewState {
    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.expanded.contains(&id)
    }

    pub fn expand(&mut self, id: NodeId) {
        self.expanded.insert(id);
    }

    pub fn collapse(&mut self, id: NodeId) {
        self.expanded.remove(&id);
    }

    /// Flips expansion and returns the new state.
    pub fn toggle(&mut self, id: NodeId) -> bool {
        if self.expanded.remove(&id) {
            false
        } else {
            self.expanded.insert(id);
            true
        }
    }

    pub fn focused(&self) -> Option<NodeId> {
        self.focused
    }

    pub fn focus(&mut self, id: Option<NodeId>) {
        self.focused = id;
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn push_notice(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    /// Removes one notice. Out-of-range indexes are ignored.
    pub fn dismiss_notice(&mut self, index: usize) -> Option<Notice> {
        (index < self.notices.len()).then(|| self.notices.remove(index))
    }

    /// Drops expansion entries for nodes that no longer exist.
    pub fn forget(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.expanded.remove(id);
        }
    }
}
