use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::hash::Hash;
use crate::core::types::Block;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BlockAdded { block: Arc<Block>, was_unorphaned: bool },
    ChainChanged { removed: Vec<Hash>, added: Vec<Hash> },
}

pub type Callback = Box<dyn Fn(&Notification) + Send + Sync>;

type SharedCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Subscriber list. Dispatch happens after the DAG lock is released, so a
/// callback may query the DAG but must not expect to see a half-applied block.
#[derive(Default)]
pub struct Notifier {
    callbacks: RwLock<Vec<SharedCallback>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: Callback) {
        self.callbacks.write().push(Arc::from(callback));
    }

    pub fn dispatch(&self, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        // snapshot, so a callback may subscribe without deadlocking
        let callbacks = self.callbacks.read().clone();
        for notification in notifications {
            for callback in callbacks.iter() {
                callback(notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_every_subscriber_sees_every_notification() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            notifier.subscribe(Box::new(move |n| seen.lock().push(n.clone())));
        }
        let n = Notification::ChainChanged { removed: vec![], added: vec![Hash([1; 32])] };
        notifier.dispatch(&[n.clone()]);
        assert_eq!(*seen.lock(), vec![n.clone(), n]);
    }

    #[test]
    fn test_callback_may_subscribe() {
        let notifier = Arc::new(Notifier::new());
        let count = Arc::new(Mutex::new(0));
        let inner = notifier.clone();
        let seen = count.clone();
        notifier.subscribe(Box::new(move |_| {
            *seen.lock() += 1;
            inner.subscribe(Box::new(|_| {}));
        }));
        let n = Notification::ChainChanged { removed: vec![], added: vec![] };
        notifier.dispatch(&[n.clone()]);
        notifier.dispatch(&[n]);
        assert_eq!(*count.lock(), 2);
        assert_eq!(notifier.callbacks.read().len(), 3);
    }
}
