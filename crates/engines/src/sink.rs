use cashier_db::types::OutboxEvent;
use cashier_primitives::UserId;

/// In-memory accumulator for one reconciliation pass.  The scheduler drains
/// the collected events into the outbox tables at the end of the tick.
#[derive(Default)]
pub struct EventSink {
    events: Vec<OutboxEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, coin: &str, user: &UserId, payload: serde_json::Value) {
        self.events.push(OutboxEvent {
            coin: coin.to_owned(),
            user: user.clone(),
            payload,
        });
    }

    pub fn take(&mut self) -> Vec<OutboxEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
