use std::collections::{HashMap, VecDeque};

use crate::store::PendingOperation;

/// Pending operations split into one ordered lane per library entry.
///
/// Lanes follow the order in which each entry first appears; inside a lane
/// operations keep their creation order.
#[derive(Debug, Default)]
pub struct EntityLanes {
    lanes: Vec<VecDeque<PendingOperation>>,
}

impl EntityLanes {
    pub fn from_operations(operations: Vec<PendingOperation>) -> Self {
        let mut slots: HashMap<i64, usize> = HashMap::new();
        let mut lanes: Vec<VecDeque<PendingOperation>> = Vec::new();
        for op in operations {
            let slot = *slots.entry(op.library_id).or_insert_with(|| {
                lanes.push(VecDeque::new());
                lanes.len() - 1
            });
            lanes[slot].push_back(op);
        }
        Self { lanes }
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn into_lanes(self) -> Vec<VecDeque<PendingOperation>> {
        self.lanes
    }
}
