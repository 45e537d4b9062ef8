use crate::types::Delivery;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const MAX_DELIVERIES_PER_ACCOUNT: usize = 50;

/// Recent inbound deliveries per account, oldest evicted first.
pub struct DeliveryLog {
    deliveries: Mutex<HashMap<String, VecDeque<Delivery>>>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            deliveries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn record(&self, delivery: Delivery) {
        let mut deliveries = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        let queue = deliveries.entry(delivery.account.clone()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(delivery);
    }

    /// Newest first.
    pub fn recent(&self, account: &str) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(MAX_DELIVERIES_PER_ACCOUNT)
    }
}
