use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::trace;

use serde_json::{Map, Value};

use tabletop::protocol::{ChangeEvent, ChangeKind, Filter, Table};

const LOG_TARGET: &str = "tabletop_server::feed";

/// Process-wide stream of committed row changes.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> ChangeFeed {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        ChangeFeed { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // no receivers just means nobody is connected
        if let Ok(n) = self.tx.send(event) {
            trace!(target: LOG_TARGET, receivers = n, "change published");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

/// What one connection asked to hear about, by the client's subscription id.
#[derive(Default)]
pub struct Interests {
    subs: HashMap<u64, (Table, Filter)>,
}

impl Interests {
    pub fn add(&mut self, sub: u64, table: Table, filter: Filter) {
        self.subs.insert(sub, (table, filter));
    }

    pub fn remove(&mut self, sub: u64) -> bool {
        self.subs.remove(&sub).is_some()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Subscription ids the event should be forwarded to, ascending.
    pub fn matching(&self, event: &ChangeEvent) -> Vec<u64> {
        let mut subs: Vec<u64> = self
            .subs
            .iter()
            .filter(|(_, (table, filter))| *table == event.table && filter.matches(&event.row))
            .map(|(sub, _)| *sub)
            .collect();
        subs.sort_unstable();
        subs
    }

    /// One stand-in `Update` per subscription, ascending, for when changes
    /// were dropped. The row carries only the filtered column, so it matches
    /// the subscription and clients that reload on any change catch up.
    pub fn resync_events(&self) -> Vec<(u64, ChangeEvent)> {
        let mut events: Vec<(u64, ChangeEvent)> = self
            .subs
            .iter()
            .map(|(sub, (table, filter))| {
                let mut row = Map::new();
                row.insert(filter.column.clone(), filter.value.clone());
                let event = ChangeEvent { table: *table, kind: ChangeKind::Update, row: Value::Object(row) };
                (*sub, event)
            })
            .collect();
        events.sort_unstable_by_key(|(sub, _)| *sub);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    fn event(table: Table, row: serde_json::Value) -> ChangeEvent {
        ChangeEvent { table, kind: ChangeKind::Insert, row }
    }

    #[test]
    fn only_matching_subscriptions_hear_an_event() {
        let mut interests = Interests::default();
        interests.add(1, Table::Tokens, Filter::eq("encounter_id", "e1"));
        interests.add(2, Table::Tokens, Filter::eq("encounter_id", "e2"));
        interests.add(3, Table::InitiativeEntries, Filter::eq("encounter_id", "e1"));
        interests.add(4, Table::Tokens, Filter::eq("encounter_id", "e1"));

        let moved = event(Table::Tokens, json!({"encounter_id": "e1", "x": 50}));
        assert_eq!(interests.matching(&moved), vec![1, 4]);

        assert!(interests.remove(4));
        assert!(!interests.remove(4));
        assert_eq!(interests.matching(&moved), vec![1]);
        assert_eq!(interests.len(), 3);
    }

    #[test]
    fn resync_sends_each_subscription_a_matching_update() {
        let mut interests = Interests::default();
        interests.add(9, Table::InitiativeEntries, Filter::eq("encounter_id", "e1"));
        interests.add(2, Table::Tokens, Filter::eq("encounter_id", "e1"));

        let events = interests.resync_events();
        let subs: Vec<u64> = events.iter().map(|(sub, _)| *sub).collect();
        assert_eq!(subs, vec![2, 9]);
        for (sub, event) in &events {
            assert_eq!(event.kind, ChangeKind::Update);
            assert_eq!(interests.matching(event), vec![*sub]);
        }
        assert_eq!(events[0].1.table, Table::Tokens);
        assert!(Interests::default().resync_events().is_empty());
    }

    #[tokio::test]
    async fn a_lagging_receiver_is_told_how_much_it_missed() {
        let feed = ChangeFeed::new(2);
        let mut slow = feed.subscribe();
        for n in 0..5 {
            feed.publish(event(Table::Tokens, json!({"encounter_id": "e1", "n": n})));
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().row["n"], 3);
    }

    #[tokio::test]
    async fn every_receiver_sees_a_published_change() {
        let feed = ChangeFeed::new(8);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        feed.publish(event(Table::DiceRolls, json!({"session_id": "s"})));
        assert_eq!(a.recv().await.unwrap().table, Table::DiceRolls);
        assert_eq!(b.recv().await.unwrap().table, Table::DiceRolls);
    }
}
