//! Outbound control-payload queue: FIFO within each priority class,
//! urgent class drained first. Thread-safe enqueue, single consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::gateway::OutboundPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    /// Handshake traffic (identify, resume, select-protocol).
    Urgent,
    /// Everything else.
    Normal,
}

#[derive(Default)]
struct Classes {
    urgent: VecDeque<OutboundPayload>,
    normal: VecDeque<OutboundPayload>,
}

pub struct OutboundQueue {
    classes: Mutex<Classes>,
    notify: Notify,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(Classes::default()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, payload: OutboundPayload, priority: SendPriority) {
        {
            let mut classes = self.classes.lock();
            match priority {
                SendPriority::Urgent => classes.urgent.push_back(payload),
                SendPriority::Normal => classes.normal.push_back(payload),
            }
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<OutboundPayload> {
        let mut classes = self.classes.lock();
        classes
            .urgent
            .pop_front()
            .or_else(|| classes.normal.pop_front())
    }

    /// Resolves when a push may have made [`Self::pop`] productive.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn clear(&self) {
        let mut classes = self.classes.lock();
        classes.urgent.clear();
        classes.normal.clear();
    }

    pub fn is_empty(&self) -> bool {
        let classes = self.classes.lock();
        classes.urgent.is_empty() && classes.normal.is_empty()
    }
}
