//! Invalidation events.
//!
//! Every invalidation issued through the engine is announced to registered
//! listeners, synchronously and in registration order, after the version key
//! has been deleted. Listeners use this to cascade into dependent scopes
//! (e.g. "users changed" re-grouping their sandboxes) where the dependency is
//! not expressed by chaining.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use strata_core::{ProviderId, SandboxId};

use crate::spaces::CacheName;

/// What was invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// A plain version key, such as an entity cache group.
    Group { version_key: String },
    /// A system group.
    System { namespace: String },
    /// Both variants of a provider group.
    Provider {
        provider: ProviderId,
        namespace: String,
    },
    /// Both variants of a sandbox group.
    Sandbox {
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: String,
    },
    /// A time window ended early.
    Window { key: String },
    /// A single cached result.
    Key {
        cache: CacheName,
        name: String,
        fragment: String,
    },
}

impl InvalidationEvent {
    /// Short event kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InvalidationEvent::Group { .. } => "group",
            InvalidationEvent::System { .. } => "system",
            InvalidationEvent::Provider { .. } => "provider",
            InvalidationEvent::Sandbox { .. } => "sandbox",
            InvalidationEvent::Window { .. } => "window",
            InvalidationEvent::Key { .. } => "key",
        }
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationEvent::Group { version_key } => write!(f, "group {version_key}"),
            InvalidationEvent::System { namespace } => write!(f, "system {namespace}"),
            InvalidationEvent::Provider {
                provider,
                namespace,
            } => write!(f, "provider {provider} in {namespace}"),
            InvalidationEvent::Sandbox {
                sandbox, namespace, ..
            } => write!(f, "sandbox {sandbox} in {namespace}"),
            InvalidationEvent::Window { key } => write!(f, "window {key}"),
            InvalidationEvent::Key {
                cache,
                name,
                fragment,
            } => write!(f, "key {name}:{fragment} in {cache}"),
        }
    }
}

/// Receives invalidation events.
pub trait InvalidationListener: Send + Sync {
    /// Handle an event. Runs on the invalidating caller's thread.
    fn on_invalidate(&self, event: &InvalidationEvent);

    /// Listener name for debugging.
    fn name(&self) -> &'static str;

    /// Check if the listener wants this event.
    fn is_interested(&self, _event: &InvalidationEvent) -> bool {
        true
    }
}

/// Ordered registry of invalidation listeners.
#[derive(Default)]
pub struct InvalidationBus {
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl InvalidationBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` after every existing one.
    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            tracing::debug!(listener = listener.name(), "Invalidation listener registered");
            listeners.push(listener);
        }
    }

    /// Remove every listener named `name`, returning how many were removed.
    pub fn unsubscribe(&self, name: &str) -> usize {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|l| l.name() != name);
                before - listeners.len()
            }
            Err(_) => 0,
        }
    }

    /// Deliver `event` to every interested listener, in order.
    ///
    /// Listeners are snapshotted first, so a listener may subscribe others
    /// without deadlocking; those receive only later events.
    pub fn emit(&self, event: &InvalidationEvent) {
        let listeners: Vec<Arc<dyn InvalidationListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        tracing::debug!(kind = event.kind(), event = %event, "Invalidation");
        for listener in listeners.iter().filter(|l| l.is_interested(event)) {
            listener.on_invalidate(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// True if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBus")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        only_system: bool,
    }

    impl InvalidationListener for Recorder {
        fn on_invalidate(&self, event: &InvalidationEvent) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}: {}", self.name, event));
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn is_interested(&self, event: &InvalidationEvent) -> bool {
            !self.only_system || matches!(event, InvalidationEvent::System { .. })
        }
    }

    #[test]
    fn test_emit_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = InvalidationBus::new();
        for name in ["first", "second"] {
            bus.subscribe(Arc::new(Recorder {
                name,
                log: log.clone(),
                only_system: false,
            }));
        }

        bus.emit(&InvalidationEvent::Group {
            version_key: "mcg-item.1".to_string(),
        });

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first: group mcg-item.1", "second: group mcg-item.1"]
        );
    }

    #[test]
    fn test_interest_filter_and_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = InvalidationBus::new();
        bus.subscribe(Arc::new(Recorder {
            name: "sys",
            log: log.clone(),
            only_system: true,
        }));

        bus.emit(&InvalidationEvent::Window {
            key: "tw".to_string(),
        });
        bus.emit(&InvalidationEvent::System {
            namespace: "tg".to_string(),
        });
        assert_eq!(*log.lock().unwrap(), vec!["sys: system tg"]);

        assert_eq!(bus.unsubscribe("sys"), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_event_kind_and_serialization() {
        let event = InvalidationEvent::Provider {
            provider: ProviderId(42),
            namespace: "tg".to_string(),
        };
        assert_eq!(event.kind(), "provider");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "provider");
        assert_eq!(json["provider"], 42);
    }
}
