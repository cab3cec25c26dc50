use std::collections::{HashMap, VecDeque};

use crate::action::{ActionError, SequencedAction};
use crate::types::*;

/// Bounded window of the most recent sequenced actions of one board.
///
/// Reconnecting clients are replayed from here; once their last seq has
/// fallen out of the window they need a full view instead.
pub struct ActionLog {
    retention: usize,
    entries: VecDeque<SequencedAction>,
    by_temp_id: HashMap<ObjectId, Seq>,
    last_seq: Seq,
}

impl ActionLog {
    pub fn new(retention: usize, last_seq: Seq) -> Self {
        Self {
            retention,
            entries: VecDeque::with_capacity(retention),
            by_temp_id: HashMap::new(),
            last_seq,
        }
    }

    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, action: SequencedAction) -> Result<(), ActionError> {
        let expected = self.last_seq + 1;
        if action.seq != expected {
            return Err(ActionError::OrderingGap {
                expected,
                got: action.seq,
            });
        }
        self.last_seq = action.seq;
        if self.retention == 0 {
            return Ok(());
        }
        if self.entries.len() == self.retention {
            if let Some(evicted) = self.entries.pop_front() {
                if let Some(temp_id) = evicted.temp_id {
                    self.by_temp_id.remove(&temp_id);
                }
            }
        }
        if let Some(temp_id) = action.temp_id {
            self.by_temp_id.insert(temp_id, action.seq);
        }
        self.entries.push_back(action);
        Ok(())
    }

    /// The retained create that was submitted under `temp_id`, if any.
    pub fn find_by_temp_id(&self, temp_id: &ObjectId) -> Option<&SequencedAction> {
        let seq = self.by_temp_id.get(temp_id)?;
        self.get(*seq)
    }

    pub fn get(&self, seq: Seq) -> Option<&SequencedAction> {
        let first = self.entries.front()?.seq;
        if seq < first {
            return None;
        }
        self.entries.get((seq - first) as usize)
    }

    /// Every action after `seq`, or `None` when part of that range is no
    /// longer retained (or `seq` is ahead of the log).
    pub fn since(&self, seq: Seq) -> Option<Vec<SequencedAction>> {
        if seq > self.last_seq {
            return None;
        }
        if seq == self.last_seq {
            return Some(Vec::new());
        }
        let first = self.entries.front()?.seq;
        if seq + 1 < first {
            return None;
        }
        Some(
            self.entries
                .iter()
                .skip((seq + 1 - first) as usize)
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    fn removed(seq: Seq) -> SequencedAction {
        SequencedAction {
            seq,
            origin: 1,
            user_id: "alice".into(),
            temp_id: None,
            action: Action::Removed {
                object_id: uuid::Uuid::new_v4(),
            },
        }
    }

    #[test]
    fn it_replays_the_gap_after_a_known_seq() {
        let mut log = ActionLog::new(10, 0);
        for seq in 1..=5 {
            log.append(removed(seq)).unwrap();
        }
        let gap = log.since(2).unwrap();
        assert_eq!(gap.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(log.since(5), Some(Vec::new()));
        assert_eq!(log.since(6), None);
    }

    #[test]
    fn it_forgets_actions_beyond_retention() {
        let mut log = ActionLog::new(3, 0);
        for seq in 1..=5 {
            log.append(removed(seq)).unwrap();
        }
        assert_eq!(log.len(), 3);
        assert!(log.since(1).is_none());
        assert_eq!(log.since(2).map(|gap| gap.len()), Some(3));
    }

    #[test]
    fn it_starts_after_a_loaded_snapshot() {
        let mut log = ActionLog::new(3, 40);
        assert_eq!(log.since(40), Some(Vec::new()));
        assert!(log.since(39).is_none());
        assert!(log.append(removed(40)).is_err());
        log.append(removed(41)).unwrap();
        assert_eq!(log.since(40).map(|gap| gap.len()), Some(1));
    }

    #[test]
    fn it_indexes_creates_by_temp_id_while_retained() {
        let mut log = ActionLog::new(1, 0);
        let temp_id = uuid::Uuid::new_v4();
        let mut create = removed(1);
        create.temp_id = Some(temp_id);
        log.append(create).unwrap();
        assert_eq!(log.find_by_temp_id(&temp_id).map(|a| a.seq), Some(1));

        log.append(removed(2)).unwrap();
        assert!(log.find_by_temp_id(&temp_id).is_none());
    }
}
