//! Container-side collaborators consumed by sessions.
//!
//! A [`SessionContext`] bundles what the surrounding container supplies:
//! the distributable flag, the decode-side [`ValueResolver`], application
//! listeners and the clock. It is built once and shared by every session
//! of a registry.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::session::Session;
use crate::value::{AttributeValue, TypeRegistry, ValueResolver};

/// Application listener for session creation and destruction.
pub trait SessionLifecycleListener: Send + Sync {
    fn session_created(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    fn session_destroyed(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    fn session_will_passivate(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    fn session_did_activate(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Application listener for attribute changes on any session.
pub trait AttributeListener: Send + Sync {
    fn attribute_added(
        &self,
        _session: &Session,
        _name: &str,
        _value: &AttributeValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// `old_value` is the value that was replaced.
    fn attribute_replaced(
        &self,
        _session: &Session,
        _name: &str,
        _old_value: &AttributeValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn attribute_removed(
        &self,
        _session: &Session,
        _name: &str,
        _value: &AttributeValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Kind of application notification being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    SessionCreated,
    SessionDestroyed,
    SessionWillPassivate,
    SessionDidActivate,
    AttributeAdded,
    AttributeReplaced,
    AttributeRemoved,
}

/// Brackets every application listener invocation.
///
/// `after_notify` is delivered even when the listener failed.
pub trait ListenerObserver: Send + Sync {
    fn before_notify(&self, kind: Notification, session_id: &str);

    fn after_notify(&self, kind: Notification, session_id: &str, failed: bool);
}

/// Collaborators shared by all sessions of one registry.
pub struct SessionContext {
    name: String,
    distributable: bool,
    resolver: Arc<dyn ValueResolver>,
    lifecycle_listeners: Vec<Arc<dyn SessionLifecycleListener>>,
    attribute_listeners: Vec<Arc<dyn AttributeListener>>,
    observer: Option<Arc<dyn ListenerObserver>>,
    clock: Arc<dyn Clock>,
}

impl SessionContext {
    /// Create a context with no listeners, an empty type registry and the
    /// system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            distributable: false,
            resolver: Arc::new(TypeRegistry::new()),
            lifecycle_listeners: Vec::new(),
            attribute_listeners: Vec::new(),
            observer: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Require every attribute value to be serializable.
    pub fn with_distributable(mut self, distributable: bool) -> Self {
        self.distributable = distributable;
        self
    }

    /// Set the resolver used when decoding object attributes.
    pub fn with_resolver(mut self, resolver: Arc<dyn ValueResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register a lifecycle listener. Destruction notifies listeners in
    /// reverse registration order.
    pub fn with_lifecycle_listener(mut self, listener: Arc<dyn SessionLifecycleListener>) -> Self {
        self.lifecycle_listeners.push(listener);
        self
    }

    pub fn with_attribute_listener(mut self, listener: Arc<dyn AttributeListener>) -> Self {
        self.attribute_listeners.push(listener);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ListenerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_distributable(&self) -> bool {
        self.distributable
    }

    pub fn resolver(&self) -> &dyn ValueResolver {
        self.resolver.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn fire_lifecycle(&self, kind: Notification, session: &Session) {
        if self.lifecycle_listeners.is_empty() {
            return;
        }
        let session_id = session.id();
        let listeners: Box<dyn Iterator<Item = &Arc<dyn SessionLifecycleListener>>> =
            if kind == Notification::SessionDestroyed {
                Box::new(self.lifecycle_listeners.iter().rev())
            } else {
                Box::new(self.lifecycle_listeners.iter())
            };
        for listener in listeners {
            self.bracket(kind, &session_id, || match kind {
                Notification::SessionCreated => listener.session_created(session),
                Notification::SessionDestroyed => listener.session_destroyed(session),
                Notification::SessionWillPassivate => listener.session_will_passivate(session),
                Notification::SessionDidActivate => listener.session_did_activate(session),
                _ => Ok(()),
            });
        }
    }

    pub(crate) fn fire_attribute(
        &self,
        kind: Notification,
        session: &Session,
        name: &str,
        value: &AttributeValue,
    ) {
        if self.attribute_listeners.is_empty() {
            return;
        }
        let session_id = session.id();
        for listener in &self.attribute_listeners {
            self.bracket(kind, &session_id, || match kind {
                Notification::AttributeAdded => listener.attribute_added(session, name, value),
                Notification::AttributeReplaced => {
                    listener.attribute_replaced(session, name, value)
                }
                Notification::AttributeRemoved => listener.attribute_removed(session, name, value),
                _ => Ok(()),
            });
        }
    }

    fn bracket(&self, kind: Notification, session_id: &str, notify: impl FnOnce() -> anyhow::Result<()>) {
        if let Some(observer) = &self.observer {
            observer.before_notify(kind, session_id);
        }
        let result = notify();
        if let Err(e) = &result {
            warn!(
                session_id = %session_id,
                notification = ?kind,
                error = %e,
                "Session listener failed"
            );
        }
        if let Some(observer) = &self.observer {
            observer.after_notify(kind, session_id, result.is_err());
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("name", &self.name)
            .field("distributable", &self.distributable)
            .field("lifecycle_listeners", &self.lifecycle_listeners.len())
            .field("attribute_listeners", &self.attribute_listeners.len())
            .field("clock", &self.clock)
            .finish()
    }
}
