//! Human-readable reconciliation events and their fan-out to front ends.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// One sentence of notification text: `"{verb} {items} at {location} from {source}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement {
    pub items: Vec<String>,
    pub verb: String,
    pub location: Option<String>,
    pub source: Option<String>,
}

impl Statement {
    pub fn new(verb: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            items: vec![item.into()],
            verb: verb.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.verb.is_empty() || self.items.is_empty() {
            return Ok(());
        }
        write!(f, "{} {}", self.verb, self.items.join(", "))?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " from {source}")?;
        }
        Ok(())
    }
}

/// Handle returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Subscriber = Box<dyn Fn(&str) + Send>;

/// Fan-out of notification text to any number of subscribers.
///
/// A push is delivered to every subscriber while the subscriber list is
/// locked, so two pushes never interleave at one subscriber. Subscribers must
/// not call back into the bus.
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Mutex<Vec<(Subscription, Subscriber)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, f: impl Fn(&str) + Send + 'static) -> Subscription {
        let id = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Box::new(f)));
        id
    }

    /// Removes a subscriber. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, id: Subscription) {
        self.lock().retain(|(sid, _)| *sid != id);
    }

    pub fn publish(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        log::info!("notification: {text}");
        for (_, f) in self.lock().iter() {
            f(text);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Subscription, Subscriber)>> {
        // poisoned by a subscriber that panicked mid-push
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn statement_renders_optional_parts() {
        assert_eq!(Statement::new("picked up", "Hookshot").to_string(), "picked up Hookshot");
        assert_eq!(
            Statement {
                location: Some("Kakariko Village".to_string()),
                source: Some("zelda".to_string()),
                ..Statement::new("opened", "bomb wall")
            }
            .to_string(),
            "opened bomb wall at Kakariko Village from zelda"
        );
        assert_eq!(Statement::default().to_string(), "");
    }

    #[test]
    fn every_subscriber_sees_every_push() {
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |t| seen.lock().unwrap().push(format!("{tag}:{t}")));
        }
        bus.publish("one");
        bus.publish("two");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:one", "b:one", "a:two", "b:two"]
        );
    }

    #[test]
    fn unsubscribe_twice_is_a_no_op() {
        let bus = NotificationBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(move |_| *c.lock().unwrap() += 1);
        bus.publish("x");
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        bus.publish("y");
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn empty_text_is_not_published() {
        let bus = NotificationBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| *c.lock().unwrap() += 1);
        bus.publish("");
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
