// Per-user undo/redo stacks keyed by (room, user).
//
// Stacks are only ever touched with their own key, so one user's undo can
// never reach into another user's history. History is bookkeeping of the
// instance the author is connected to; it is not replicated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use easel_common::types::{Action, OpType, Operation};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub user_id: String,
    pub room_id: String,
    /// Operation this entry was built from.
    pub operation_ref: Uuid,
    pub element_id: String,
    pub op_type: OpType,
    pub forward_state: Option<Value>,
    pub inverse_state: Option<Value>,
}

impl UndoEntry {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            user_id: op.user_id.clone(),
            room_id: op.room_id.clone(),
            operation_ref: op.op_id,
            element_id: op.element_id.clone(),
            op_type: op.op_type,
            forward_state: op.after_state.clone(),
            inverse_state: op.before_state.clone(),
        }
    }

    /// A fresh action that reverses this entry.
    pub fn inverse_action(&self) -> Action {
        Action {
            op_id: Uuid::new_v4(),
            element_id: self.element_id.clone(),
            op_type: self.op_type.inverse(),
            before_state: self.forward_state.clone(),
            after_state: self.inverse_state.clone(),
        }
    }

    /// A fresh action that re-applies this entry.
    pub fn forward_action(&self) -> Action {
        Action {
            op_id: Uuid::new_v4(),
            element_id: self.element_id.clone(),
            op_type: self.op_type,
            before_state: self.inverse_state.clone(),
            after_state: self.forward_state.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct UserHistory {
    undo: VecDeque<UndoEntry>,
    redo: Vec<UndoEntry>,
}

type HistoryKey = (String, String);

#[derive(Clone)]
pub struct HistoryStore {
    stacks: Arc<RwLock<HashMap<HistoryKey, Arc<Mutex<UserHistory>>>>>,
    depth: usize,
}

impl HistoryStore {
    pub fn new(depth: usize) -> Self {
        Self { stacks: Arc::new(RwLock::new(HashMap::new())), depth: depth.max(1) }
    }

    async fn stack(&self, room_id: &str, user_id: &str) -> Arc<Mutex<UserHistory>> {
        let key = (room_id.to_string(), user_id.to_string());
        if let Some(stack) = self.stacks.read().await.get(&key) {
            return Arc::clone(stack);
        }
        Arc::clone(self.stacks.write().await.entry(key).or_default())
    }

    async fn existing(&self, room_id: &str, user_id: &str) -> Option<Arc<Mutex<UserHistory>>> {
        self.stacks.read().await.get(&(room_id.to_string(), user_id.to_string())).cloned()
    }

    /// Record a winning operation by its author. Clears the author's redo
    /// stack and drops the oldest entry beyond the configured depth.
    pub async fn push(&self, op: &Operation) {
        let stack = self.stack(&op.room_id, &op.user_id).await;
        let mut history = stack.lock().await;
        history.undo.push_back(UndoEntry::from_operation(op));
        while history.undo.len() > self.depth {
            history.undo.pop_front();
        }
        history.redo.clear();
    }

    /// Pop the newest entry onto the redo stack. `None` on an empty stack.
    pub async fn undo(&self, room_id: &str, user_id: &str) -> Option<UndoEntry> {
        let stack = self.existing(room_id, user_id).await?;
        let mut history = stack.lock().await;
        let entry = history.undo.pop_back()?;
        history.redo.push(entry.clone());
        Some(entry)
    }

    /// Mirror of [`undo`](Self::undo).
    pub async fn redo(&self, room_id: &str, user_id: &str) -> Option<UndoEntry> {
        let stack = self.existing(room_id, user_id).await?;
        let mut history = stack.lock().await;
        let entry = history.redo.pop()?;
        history.undo.push_back(entry.clone());
        while history.undo.len() > self.depth {
            history.undo.pop_front();
        }
        Some(entry)
    }

    /// Remove the entry for an operation that was later superseded inside
    /// its conflict window.
    pub async fn retract(&self, room_id: &str, user_id: &str, op_id: Uuid) -> bool {
        let Some(stack) = self.existing(room_id, user_id).await else {
            return false;
        };
        let mut history = stack.lock().await;
        match history.undo.iter().rposition(|entry| entry.operation_ref == op_id) {
            Some(position) => history.undo.remove(position).is_some(),
            None => false,
        }
    }

    /// `(undo_depth, redo_depth)`.
    pub async fn depth(&self, room_id: &str, user_id: &str) -> (usize, usize) {
        match self.existing(room_id, user_id).await {
            Some(stack) => {
                let history = stack.lock().await;
                (history.undo.len(), history.redo.len())
            }
            None => (0, 0),
        }
    }

    pub async fn discard_room(&self, room_id: &str) {
        self.stacks.write().await.retain(|(room, _), _| room != room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(user_id: &str, element_id: &str, before: Option<Value>, after: Value) -> Operation {
        Operation {
            op_id: Uuid::new_v4(),
            room_id: "doc-1".into(),
            user_id: user_id.into(),
            element_id: element_id.into(),
            op_type: OpType::Update,
            before_state: before,
            after_state: Some(after),
            server_timestamp: 0,
        }
    }

    #[tokio::test]
    async fn undo_then_redo_moves_entries_between_stacks() {
        let history = HistoryStore::new(10);
        let edit = op("A", "shape-1", Some(json!({"fill": "red"})), json!({"fill": "blue"}));
        history.push(&edit).await;

        let undone = history.undo("doc-1", "A").await.expect("entry to undo");
        assert_eq!(undone.operation_ref, edit.op_id);
        assert_eq!(undone.inverse_action().after_state, Some(json!({"fill": "red"})));
        assert_eq!(history.depth("doc-1", "A").await, (0, 1));

        let redone = history.redo("doc-1", "A").await.expect("entry to redo");
        assert_eq!(redone.forward_action().after_state, Some(json!({"fill": "blue"})));
        assert_eq!(history.depth("doc-1", "A").await, (1, 0));
    }

    #[tokio::test]
    async fn empty_stacks_are_silent() {
        let history = HistoryStore::new(10);
        assert!(history.undo("doc-1", "A").await.is_none());
        assert!(history.redo("doc-1", "A").await.is_none());
        assert_eq!(history.depth("doc-1", "A").await, (0, 0));
    }

    #[tokio::test]
    async fn undo_never_touches_other_users() {
        let history = HistoryStore::new(10);
        history.push(&op("A", "shape-1", None, json!({"x": 1}))).await;
        history.push(&op("B", "shape-1", None, json!({"x": 2}))).await;
        history.push(&op("B", "shape-1", None, json!({"x": 3}))).await;

        history.undo("doc-1", "A").await;
        assert_eq!(history.depth("doc-1", "A").await, (0, 1));
        assert_eq!(history.depth("doc-1", "B").await, (2, 0));
    }

    #[tokio::test]
    async fn new_edit_clears_redo() {
        let history = HistoryStore::new(10);
        history.push(&op("A", "shape-1", None, json!({"x": 1}))).await;
        history.undo("doc-1", "A").await;
        history.push(&op("A", "shape-2", None, json!({"x": 2}))).await;
        assert_eq!(history.depth("doc-1", "A").await, (1, 0));
    }

    #[tokio::test]
    async fn depth_is_capped() {
        let history = HistoryStore::new(2);
        let first = op("A", "shape-1", None, json!({"x": 1}));
        history.push(&first).await;
        history.push(&op("A", "shape-1", None, json!({"x": 2}))).await;
        history.push(&op("A", "shape-1", None, json!({"x": 3}))).await;

        assert_eq!(history.depth("doc-1", "A").await, (2, 0));
        assert!(!history.retract("doc-1", "A", first.op_id).await);
    }

    #[tokio::test]
    async fn retract_removes_superseded_entry() {
        let history = HistoryStore::new(10);
        let edit = op("A", "shape-1", None, json!({"x": 1}));
        history.push(&edit).await;
        assert!(history.retract("doc-1", "A", edit.op_id).await);
        assert_eq!(history.depth("doc-1", "A").await, (0, 0));
    }

    #[test]
    fn inverse_of_create_is_delete() {
        let mut created = op("A", "shape-1", None, json!({"kind": "rect"}));
        created.op_type = OpType::Create;
        let inverse = UndoEntry::from_operation(&created).inverse_action();
        assert_eq!(inverse.op_type, OpType::Delete);
        assert_eq!(inverse.after_state, None);
        assert_eq!(inverse.before_state, Some(json!({"kind": "rect"})));
    }
}
