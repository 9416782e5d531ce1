//! Conversation tracking
//!
//! Correlates requests with their replies on one link. Locally allocated ids
//! are even and stay below 2^31; odd ids and the upper half of the id space
//! are left for the peer's own conversations.

use std::collections::HashSet;
use thiserror::Error;

/// Locally allocated ids wrap before reaching this value
pub const LOCAL_ID_LIMIT: u32 = 1 << 31;

const ID_STEP: u32 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Conversation {0} is not open")]
    Closed(u32),

    #[error("No free conversation ids")]
    Exhausted,
}

pub type ConversationResult<T> = Result<T, ConversationError>;

/// Open conversations of a single link
#[derive(Debug, Default)]
pub struct ConversationTracker {
    open: HashSet<u32>,
    last_allocated: Option<u32>,
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a conversation
    ///
    /// Without an explicit id the next even id is allocated. An explicit
    /// (peer-chosen) id is registered unless it is already open, in which
    /// case it is returned unchanged.
    pub fn begin(&mut self, explicit: Option<u32>) -> ConversationResult<u32> {
        if let Some(id) = explicit {
            self.open.insert(id);
            return Ok(id);
        }

        if self.open.len() as u64 >= u64::from(LOCAL_ID_LIMIT / ID_STEP) {
            return Err(ConversationError::Exhausted);
        }

        let mut candidate = self.next_candidate(self.last_allocated);
        while self.open.contains(&candidate) {
            candidate = self.next_candidate(Some(candidate));
        }

        self.last_allocated = Some(candidate);
        self.open.insert(candidate);
        Ok(candidate)
    }

    fn next_candidate(&self, previous: Option<u32>) -> u32 {
        match previous {
            None => 0,
            Some(id) => {
                let next = id.wrapping_add(ID_STEP) & !1;
                if next >= LOCAL_ID_LIMIT {
                    0
                } else {
                    next
                }
            }
        }
    }

    /// Register an incoming packet's conversation
    ///
    /// Requests may open fresh ids; anything else must belong to an open
    /// conversation.
    pub fn accept(&mut self, id: u32, is_request: bool) -> ConversationResult<()> {
        if self.open.contains(&id) {
            return Ok(());
        }
        if is_request {
            self.open.insert(id);
            Ok(())
        } else {
            Err(ConversationError::Closed(id))
        }
    }

    pub fn is_open(&self, id: u32) -> bool {
        self.open.contains(&id)
    }

    /// Retire a conversation; closing an id that is not open does nothing
    pub fn close(&mut self, id: u32) {
        self.open.remove(&id);
    }

    /// Retire every conversation, e.g. when the link goes away
    pub fn close_all(&mut self) {
        self.open.clear();
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_ids_are_even_and_sequential() {
        let mut tracker = ConversationTracker::new();
        let ids: Vec<u32> = (0..5).map(|_| tracker.begin(None).unwrap()).collect();
        assert_eq!(ids, vec![0, 2, 4, 6, 8]);
        assert!(ids.iter().all(|id| tracker.is_open(*id)));
    }

    #[test]
    fn test_auto_ids_never_repeat_open_ids() {
        let mut tracker = ConversationTracker::new();
        tracker.begin(Some(4)).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = tracker.begin(None).unwrap();
            assert_eq!(id % 2, 0);
            assert_ne!(id, 4);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_auto_ids_wrap_below_upper_half() {
        let mut tracker = ConversationTracker::new();
        tracker.begin(Some(0)).unwrap();
        tracker.last_allocated = Some(LOCAL_ID_LIMIT - 2);
        // 0 is still open, so the wrap lands on 2
        assert_eq!(tracker.begin(None).unwrap(), 2);
    }

    #[test]
    fn test_explicit_id_registration() {
        let mut tracker = ConversationTracker::new();
        assert_eq!(tracker.begin(Some(7)).unwrap(), 7);
        assert_eq!(tracker.begin(Some(7)).unwrap(), 7);
        assert_eq!(tracker.open_count(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut tracker = ConversationTracker::new();
        let id = tracker.begin(None).unwrap();
        tracker.close(id);
        tracker.close(id);
        tracker.close(1234);
        assert!(!tracker.is_open(id));
    }

    #[test]
    fn test_closed_id_rejects_replies() {
        let mut tracker = ConversationTracker::new();
        let id = tracker.begin(None).unwrap();
        assert_eq!(tracker.accept(id, false), Ok(()));
        tracker.close(id);
        assert_eq!(tracker.accept(id, false), Err(ConversationError::Closed(id)));
        assert_eq!(tracker.accept(id, true), Ok(()));
        assert!(tracker.is_open(id));
    }
}
