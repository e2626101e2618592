//! Topic pattern matching and the subscription registry.
//!
//! Patterns use MQTT wildcard semantics: `+` matches exactly one topic level,
//! `#` matches any number of remaining levels and is only valid as the final
//! level. Dispatch evaluates every registered pattern against an incoming
//! topic, in registration order, with no short-circuit on first match.

use crate::codec::TelemetryEnvelope;
use skyrelay_common::{RelayError, Result};
use std::sync::Arc;
use tracing::debug;

/// Callback invoked for each matching subscription. Runs synchronously on the
/// broker I/O context; must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &TelemetryEnvelope) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A compiled topic pattern. Identity is the literal pattern string.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: String,
    segments: Vec<Segment>,
}

impl TopicFilter {
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(RelayError::Config("empty topic pattern".to_string()));
        }

        let raw: Vec<&str> = pattern.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (i, seg) in raw.iter().enumerate() {
            let compiled = match *seg {
                "+" => Segment::SingleLevel,
                "#" => {
                    if i != raw.len() - 1 {
                        return Err(RelayError::Config(format!(
                            "'#' must be the final level in pattern '{}'",
                            pattern
                        )));
                    }
                    Segment::MultiLevel
                }
                s if s.contains('+') || s.contains('#') => {
                    return Err(RelayError::Config(format!(
                        "wildcard must occupy a whole level in pattern '{}'",
                        pattern
                    )));
                }
                s => Segment::Literal(s.to_string()),
            };
            segments.push(compiled);
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                // '#' also matches the parent level itself
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

struct Subscription {
    filter: TopicFilter,
    handler: MessageHandler,
}

/// Ordered table of subscriptions. Registering an existing pattern replaces
/// its handler in place, keeping the original registration position.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern. Returns `true` when the pattern is
    /// new, `false` when an existing subscription's handler was replaced (so
    /// the caller can skip the broker-level subscribe).
    pub fn register(&mut self, pattern: &str, handler: MessageHandler) -> Result<bool> {
        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|s| s.filter.pattern() == pattern)
        {
            debug!(pattern, "replacing handler for existing subscription");
            existing.handler = handler;
            return Ok(false);
        }

        let filter = TopicFilter::compile(pattern)?;
        debug!(pattern, "adding subscription");
        self.subscriptions.push(Subscription { filter, handler });
        Ok(true)
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.filter.pattern() == pattern)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.filter.pattern())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Invoke the handler of every subscription whose pattern matches `topic`,
    /// in registration order. Returns the number of handlers invoked.
    pub fn match_and_dispatch(&self, topic: &str, envelope: &TelemetryEnvelope) -> usize {
        let mut invoked = 0;
        for subscription in &self.subscriptions {
            if subscription.filter.matches(topic) {
                (subscription.handler)(topic, envelope);
                invoked += 1;
            }
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TelemetryEnvelope;
    use skyrelay_common::TelemetryRecord;
    use std::sync::Mutex;

    fn envelope() -> TelemetryEnvelope {
        TelemetryEnvelope::from_record(&TelemetryRecord::now().with("altitude", 1i64))
    }

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicFilter::compile(pattern).unwrap().matches(topic)
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(matches("Delta/N304DL/DL77/MSI", "Delta/N304DL/DL77/MSI"));
        assert!(!matches("Delta/N304DL/DL77/MSI", "Delta/N304DL/DL77"));
        assert!(!matches("Delta/N304DL", "Delta/N304DL/DL77"));
    }

    #[test]
    fn single_level_wildcard_matches_one_level_only() {
        assert!(matches("Delta/+/DL77/MSI", "Delta/N304DL/DL77/MSI"));
        assert!(!matches("Delta/+/MSI", "Delta/N304DL/DL77/MSI"));
        assert!(!matches("Delta/+", "Delta"));
        assert!(matches("+/status", "flight/status"));
    }

    #[test]
    fn multi_level_wildcard_matches_remaining_levels() {
        assert!(matches("Delta/#", "Delta/N304DL/DL77/MSI"));
        assert!(matches("Delta/#", "Delta/N304DL"));
        // '#' matches the parent level too
        assert!(matches("Delta/#", "Delta"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("Delta/#", "United/N100UA"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(TopicFilter::compile("").is_err());
        assert!(TopicFilter::compile("Delta/#/MSI").is_err());
        assert!(TopicFilter::compile("Delta/N3+4DL").is_err());
    }

    #[test]
    fn dispatch_invokes_all_matches_in_registration_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();

        for (label, pattern) in [
            ("wide", "Delta/#"),
            ("miss", "United/#"),
            ("narrow", "Delta/+/DL77/MSI"),
        ] {
            let order = order.clone();
            registry
                .register(
                    pattern,
                    Arc::new(move |_topic, _env| order.lock().unwrap().push(label)),
                )
                .unwrap();
        }

        let invoked = registry.match_and_dispatch("Delta/N304DL/DL77/MSI", &envelope());
        assert_eq!(invoked, 2);
        assert_eq!(*order.lock().unwrap(), vec!["wide", "narrow"]);
    }

    #[test]
    fn dispatch_with_no_match_invokes_nothing() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register("Delta/#", Arc::new(|_, _| panic!("should not fire")))
            .unwrap();
        assert_eq!(registry.match_and_dispatch("United/N100UA", &envelope()), 0);
    }

    #[test]
    fn reregistering_replaces_handler_in_place() {
        let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();

        let h = hits.clone();
        assert!(registry
            .register("T/#", Arc::new(move |_, _| h.lock().unwrap().push("h1")))
            .unwrap());

        let h = hits.clone();
        assert!(!registry
            .register("T/#", Arc::new(move |_, _| h.lock().unwrap().push("h2")))
            .unwrap());

        assert_eq!(registry.len(), 1);
        registry.match_and_dispatch("T/a", &envelope());
        assert_eq!(*hits.lock().unwrap(), vec!["h2"]);
    }
}
