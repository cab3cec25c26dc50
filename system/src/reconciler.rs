use std::collections::{HashMap, VecDeque};

use crate::action::ActionRequest;
use crate::types::*;

/// Where a request should go after temp-id resolution.
#[derive(Debug, PartialEq)]
pub enum Routed {
    Forward(ActionRequest),
    /// Held until the create it depends on is acknowledged.
    Queued,
}

/// Per-session remapping of client placeholder ids to durable ids.
///
/// Edits against an object whose create is still in flight are queued under
/// its temp id and handed back, retargeted, once the create is acknowledged.
pub struct Reconciler {
    pending: HashMap<ObjectId, VecDeque<ActionRequest>>,
    aliases: HashMap<ObjectId, ObjectId>,
    alias_order: VecDeque<ObjectId>,
    alias_capacity: usize,
}

impl Reconciler {
    pub fn new(alias_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            aliases: HashMap::new(),
            alias_order: VecDeque::new(),
            alias_capacity,
        }
    }

    pub fn route(&mut self, request: ActionRequest) -> Routed {
        if let Some(temp_id) = request.temp_id() {
            self.pending.entry(temp_id).or_default();
            return Routed::Forward(request);
        }
        match request.target() {
            Some(target) => {
                if let Some(queue) = self.pending.get_mut(&target) {
                    queue.push_back(request);
                    Routed::Queued
                } else if let Some(durable_id) = self.aliases.get(&target) {
                    Routed::Forward(request.retarget(*durable_id))
                } else {
                    Routed::Forward(request)
                }
            }
            None => Routed::Forward(request),
        }
    }

    /// Retires `temp_id` and returns its queued edits, retargeted at
    /// `durable_id`, in the order they were issued.
    pub fn acknowledge(&mut self, temp_id: ObjectId, durable_id: ObjectId) -> Vec<ActionRequest> {
        let queued = self.pending.remove(&temp_id).unwrap_or_default();
        self.remember_alias(temp_id, durable_id);
        queued
            .into_iter()
            .map(|request| request.retarget(durable_id))
            .collect()
    }

    /// Drops `temp_id` after its create was refused; returns the edits that
    /// can no longer be applied.
    pub fn reject(&mut self, temp_id: ObjectId) -> Vec<ActionRequest> {
        self.pending
            .remove(&temp_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drops every pending create; returns the queued edits.
    pub fn clear(&mut self) -> Vec<ActionRequest> {
        self.aliases.clear();
        self.alias_order.clear();
        self.pending.drain().flat_map(|(_, queue)| queue).collect()
    }

    fn remember_alias(&mut self, temp_id: ObjectId, durable_id: ObjectId) {
        if self.alias_capacity == 0 {
            return;
        }
        if self.aliases.insert(temp_id, durable_id).is_none() {
            self.alias_order.push_back(temp_id);
        }
        while self.alias_order.len() > self.alias_capacity {
            if let Some(oldest) = self.alias_order.pop_front() {
                self.aliases.remove(&oldest);
            }
        }
    }
}
