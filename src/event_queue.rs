//! Per-session in-memory FIFO for events produced while a session is
//! disconnected. Unbounded — the outbound-reconnect path is
//! responsible for trimming/flushing on reconnect.

use dashmap::DashMap;

use crate::model::Event;

#[derive(Default)]
pub struct EventQueue {
    queues: DashMap<String, Vec<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: Event) {
        self.queues.entry(event.session_id.clone()).or_default().push(event);
    }

    /// Drains and returns a defensive copy of the session's queue, in order.
    pub fn flush(&self, session_id: &str) -> Vec<Event> {
        self.queues
            .remove(session_id)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn size(&self, session_id: &str) -> usize {
        self.queues.get(session_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    fn ev(session_id: &str) -> Event {
        Event::new(EventType::MessageReceived, session_id, serde_json::json!({}))
    }

    #[test]
    fn enqueue_preserves_order_and_flush_drains() {
        let q = EventQueue::new();
        let e1 = ev("s1");
        let e2 = ev("s1");
        q.enqueue(e1.clone());
        q.enqueue(e2.clone());
        assert_eq!(q.size("s1"), 2);
        let flushed = q.flush("s1");
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].id, e1.id);
        assert_eq!(flushed[1].id, e2.id);
        assert_eq!(q.size("s1"), 0);
    }

    #[test]
    fn sessions_are_independent() {
        let q = EventQueue::new();
        q.enqueue(ev("a"));
        q.enqueue(ev("b"));
        q.enqueue(ev("b"));
        assert_eq!(q.total_size(), 3);
        let mut sessions = q.sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(q.flush("a").len(), 1);
        assert_eq!(q.flush("b").len(), 2);
        assert_eq!(q.total_size(), 0);
    }

    #[test]
    fn flush_on_unknown_session_is_empty() {
        let q = EventQueue::new();
        assert_eq!(q.flush("nope"), Vec::new());
    }
}
