//! Scheduling queues.

use crate::error::WriteOperation;
use crate::types::Oid;
use std::collections::HashSet;

/// An insertion-ordered set of documents.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScheduleQueue {
    order: Vec<Oid>,
    members: HashSet<Oid>,
}

impl ScheduleQueue {
    pub(crate) fn push(&mut self, oid: Oid) -> bool {
        if !self.members.insert(oid) {
            return false;
        }
        self.order.push(oid);
        true
    }

    pub(crate) fn remove(&mut self, oid: Oid) -> bool {
        if !self.members.remove(&oid) {
            return false;
        }
        self.order.retain(|o| *o != oid);
        true
    }

    pub(crate) fn contains(&self, oid: Oid) -> bool {
        self.members.contains(&oid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        self.order.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// The four disjoint write queues of a unit of work.
#[derive(Debug, Clone, Default)]
pub(crate) struct Schedule {
    upserts: ScheduleQueue,
    inserts: ScheduleQueue,
    updates: ScheduleQueue,
    deletes: ScheduleQueue,
}

impl Schedule {
    /// Phase order of a flush.
    pub(crate) const PHASES: [WriteOperation; 4] = [
        WriteOperation::Upsert,
        WriteOperation::Insert,
        WriteOperation::Update,
        WriteOperation::Delete,
    ];

    pub(crate) fn queue(&self, operation: WriteOperation) -> &ScheduleQueue {
        match operation {
            WriteOperation::Upsert => &self.upserts,
            WriteOperation::Insert => &self.inserts,
            WriteOperation::Update => &self.updates,
            WriteOperation::Delete => &self.deletes,
        }
    }

    fn queue_mut(&mut self, operation: WriteOperation) -> &mut ScheduleQueue {
        match operation {
            WriteOperation::Upsert => &mut self.upserts,
            WriteOperation::Insert => &mut self.inserts,
            WriteOperation::Update => &mut self.updates,
            WriteOperation::Delete => &mut self.deletes,
        }
    }

    /// Moves `oid` into the queue for `operation`, out of any other.
    pub(crate) fn schedule(&mut self, oid: Oid, operation: WriteOperation) {
        for phase in Self::PHASES {
            if phase != operation {
                self.queue_mut(phase).remove(oid);
            }
        }
        self.queue_mut(operation).push(oid);
    }

    pub(crate) fn unschedule(&mut self, oid: Oid) -> Option<WriteOperation> {
        Self::PHASES
            .into_iter()
            .find(|phase| self.queue_mut(*phase).remove(oid))
    }

    pub(crate) fn remove(&mut self, oid: Oid, operation: WriteOperation) -> bool {
        self.queue_mut(operation).remove(oid)
    }

    pub(crate) fn scheduled(&self, oid: Oid) -> Option<WriteOperation> {
        Self::PHASES.into_iter().find(|phase| self.queue(*phase).contains(oid))
    }

    pub(crate) fn is_scheduled(&self, oid: Oid, operation: WriteOperation) -> bool {
        self.queue(operation).contains(oid)
    }

    pub(crate) fn is_empty(&self) -> bool {
        Self::PHASES.iter().all(|phase| self.queue(*phase).len() == 0)
    }

    pub(crate) fn clear(&mut self) {
        for phase in Self::PHASES {
            self.queue_mut(phase).clear();
        }
    }
}
