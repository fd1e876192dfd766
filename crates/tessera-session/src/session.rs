//! The session entity and its lifecycle state machine.
//!
//! A [`Session`] is shared as `Arc<Session>` between the registry, request
//! handlers and background policies. All state sits behind interior locks;
//! no lock is held while listener or attribute hooks run, so hooks may call
//! back into the session freely.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::clock::elapsed;
use crate::codec::{RECORD_VERSION, SessionRecord, StoredAttribute, StoredValue};
use crate::context::{Notification, SessionContext};
use crate::error::{Error, Result};
use crate::registry::RegistryShared;
use crate::value::AttributeValue;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created and not yet accessed by a request.
    New,
    /// Resident and in use.
    Active,
    /// Written out to a store, or just read back and not yet activated.
    Passive,
    /// Expiration in progress.
    Expiring,
    /// Terminal.
    Expired,
}

/// Event delivered to listeners attached to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session was registered as new.
    Created,
    /// The session expired with notifications.
    Destroyed,
    /// About to be swapped out to the store.
    Passivated,
    /// Swapped back in from the store.
    Activated,
}

/// Listener attached to a single session with [`Session::add_listener`].
pub trait SessionEventListener: Send + Sync {
    fn session_event(&self, session: &Session, event: SessionEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Passive,
    Expiring,
    Expired,
}

#[derive(Debug, Clone)]
struct SessionCore {
    id: String,
    creation_time: DateTime<Utc>,
    last_accessed_time: DateTime<Utc>,
    this_accessed_time: DateTime<Utc>,
    max_inactive_secs: i32,
    is_new: bool,
    valid: bool,
    phase: Phase,
}

impl SessionCore {
    fn blank() -> Self {
        Self {
            id: String::new(),
            creation_time: DateTime::<Utc>::default(),
            last_accessed_time: DateTime::<Utc>::default(),
            this_accessed_time: DateTime::<Utc>::default(),
            max_inactive_secs: -1,
            is_new: false,
            valid: false,
            phase: Phase::Expired,
        }
    }

    fn idle_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.max_inactive_secs >= 0
            && elapsed(self.this_accessed_time, now)
                >= Duration::from_secs(self.max_inactive_secs as u64)
    }

    /// Valid, or inside its own expiration.
    fn usable(&self) -> bool {
        self.phase == Phase::Expiring || self.valid
    }
}

/// One client's server-side state.
pub struct Session {
    core: Mutex<SessionCore>,
    attributes: RwLock<HashMap<String, AttributeValue>>,
    notes: Mutex<HashMap<String, serde_json::Value>>,
    principal: Mutex<Option<String>>,
    access_count: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn SessionEventListener>>>,
    context: Arc<SessionContext>,
    registry: Weak<RegistryShared>,
}

impl Session {
    pub(crate) fn new(context: Arc<SessionContext>, registry: Weak<RegistryShared>) -> Self {
        Self {
            core: Mutex::new(SessionCore::blank()),
            attributes: RwLock::new(HashMap::new()),
            notes: Mutex::new(HashMap::new()),
            principal: Mutex::new(None),
            access_count: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            context,
            registry,
        }
    }

    /// Stamp a blank session as freshly created.
    pub(crate) fn initialize(&self, id: String, max_inactive_secs: i32) {
        let now = self.context.clock().now();
        *self.core.lock() = SessionCore {
            id,
            creation_time: now,
            last_accessed_time: now,
            this_accessed_time: now,
            max_inactive_secs,
            is_new: true,
            valid: true,
            phase: Phase::Active,
        };
    }

    /// Current identifier.
    pub fn id(&self) -> String {
        self.core.lock().id.clone()
    }

    pub(crate) fn set_id(&self, id: String) {
        self.core.lock().id = id;
    }

    /// Container collaborator shared by every session of the registry.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// When the session was first created. Survives swap-out.
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.core.lock().creation_time
    }

    /// Start of the request before the current one.
    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.core.lock().last_accessed_time
    }

    /// Start of the most recent request.
    pub fn this_accessed_time(&self) -> DateTime<Utc> {
        self.core.lock().this_accessed_time
    }

    /// Timeout in seconds; negative means the session never times out.
    pub fn max_inactive_secs(&self) -> i32 {
        self.core.lock().max_inactive_secs
    }

    /// Timeout as a duration, or `None` when it never times out.
    pub fn max_inactive_interval(&self) -> Option<Duration> {
        let secs = self.max_inactive_secs();
        (secs >= 0).then(|| Duration::from_secs(secs as u64))
    }

    /// Set the timeout in seconds. Negative disables it.
    pub fn set_max_inactive_interval(&self, secs: i32) {
        self.core.lock().max_inactive_secs = secs;
    }

    /// True until the first access after creation.
    pub fn is_new(&self) -> bool {
        self.core.lock().is_new
    }

    /// Lifecycle state as seen by callers.
    pub fn state(&self) -> SessionState {
        let core = self.core.lock();
        match core.phase {
            Phase::Active if core.is_new => SessionState::New,
            Phase::Active => SessionState::Active,
            Phase::Passive => SessionState::Passive,
            Phase::Expiring => SessionState::Expiring,
            Phase::Expired => SessionState::Expired,
        }
    }

    /// Requests currently using this session.
    pub fn access_count(&self) -> usize {
        self.access_count.load(Ordering::Acquire)
    }

    /// Time since the most recent access began.
    pub fn idle_time(&self) -> Duration {
        let since = self.core.lock().this_accessed_time;
        elapsed(since, self.context.clock().now())
    }

    /// Whether the session is still usable.
    ///
    /// A session that has been idle past its timeout is expired as a side
    /// effect. Sessions in use by a request are always valid.
    pub fn is_valid(&self) -> bool {
        let now = self.context.clock().now();
        let timed_out = {
            let core = self.core.lock();
            if core.phase == Phase::Expiring {
                return true;
            }
            if !core.valid {
                return false;
            }
            core.idle_exceeded(now)
        };
        if self.access_count() > 0 {
            return true;
        }
        if timed_out {
            self.expire();
        }
        self.core.lock().valid
    }

    /// Whether the session is invalid or timed out at `now`, without
    /// expiring it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_count() > 0 {
            return false;
        }
        let core = self.core.lock();
        core.phase != Phase::Expiring && (!core.valid || core.idle_exceeded(now))
    }

    /// Mark the start of a request using this session.
    pub fn access(&self) {
        self.is_valid();
        self.access_count.fetch_add(1, Ordering::AcqRel);
        let now = self.context.clock().now();
        let mut core = self.core.lock();
        core.last_accessed_time = core.this_accessed_time;
        core.this_accessed_time = now;
        core.is_new = false;
    }

    /// Mark the end of a request using this session.
    pub fn end_access(&self) {
        let _ = self
            .access_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.core.lock().is_new = false;
    }

    /// [`access`](Self::access) the session and release it when the guard drops.
    pub fn begin_access(self: &Arc<Self>) -> AccessGuard {
        self.access();
        AccessGuard {
            session: Arc::clone(self),
        }
    }

    /// Expire the session, notifying listeners.
    pub fn expire(&self) {
        self.expire_with(true);
    }

    /// Expire the session.
    ///
    /// With `notify` false no listener, hook or store callback runs; this is
    /// used when draining sessions that were just persisted. Calling this on
    /// a session that is expired or already expiring does nothing.
    pub fn expire_with(&self, notify: bool) {
        let (id, created) = {
            let mut core = self.core.lock();
            if matches!(core.phase, Phase::Expiring | Phase::Expired) || !core.valid {
                return;
            }
            core.phase = Phase::Expiring;
            (core.id.clone(), core.creation_time)
        };

        if notify {
            self.context
                .fire_lifecycle(Notification::SessionDestroyed, self);
        }

        self.core.lock().valid = false;
        let alive = elapsed(created, self.context.clock().now());
        if let Some(registry) = self.registry.upgrade() {
            registry.session_expired(&id, self, alive, notify);
        }

        if notify {
            self.fire_event(SessionEvent::Destroyed);
        }

        let names: Vec<String> = self.attributes.read().keys().cloned().collect();
        for name in names {
            self.remove_attribute_internal(&name, notify);
        }

        self.access_count.store(0, Ordering::Release);
        self.core.lock().phase = Phase::Expired;
        debug!(
            session_id = %id,
            alive_secs = alive.as_secs(),
            notify,
            "Session expired"
        );
    }

    /// Invalidate the session on behalf of the application.
    pub fn invalidate(&self) -> Result<()> {
        self.ensure_usable()?;
        self.expire();
        Ok(())
    }

    /// Prepare the session to leave memory.
    pub fn passivate(&self) {
        {
            let mut core = self.core.lock();
            if core.phase != Phase::Active {
                return;
            }
            core.phase = Phase::Passive;
        }
        self.fire_event(SessionEvent::Passivated);
        self.context
            .fire_lifecycle(Notification::SessionWillPassivate, self);
        for (name, obj) in self.object_attributes() {
            if let Err(e) = obj.will_passivate(self) {
                warn!(session_id = %self.id(), attribute = %name, error = %e, "Passivation hook failed");
            }
        }
    }

    /// Bring a passive session back into service.
    pub fn activate(&self) {
        {
            let mut core = self.core.lock();
            if core.phase != Phase::Passive {
                return;
            }
            core.phase = Phase::Active;
        }
        self.fire_event(SessionEvent::Activated);
        self.context
            .fire_lifecycle(Notification::SessionDidActivate, self);
        for (name, obj) in self.object_attributes() {
            if let Err(e) = obj.did_activate(self) {
                warn!(session_id = %self.id(), attribute = %name, error = %e, "Activation hook failed");
            }
        }
    }

    /// Deliver creation notifications.
    pub(crate) fn tell_new(&self) {
        self.fire_event(SessionEvent::Created);
        self.context
            .fire_lifecycle(Notification::SessionCreated, self);
    }

    /// Clear every field so the object can be reused.
    pub(crate) fn recycle(&self) {
        self.attributes.write().clear();
        self.notes.lock().clear();
        *self.principal.lock() = None;
        self.listeners.lock().clear();
        self.access_count.store(0, Ordering::Release);
        *self.core.lock() = SessionCore::blank();
    }

    /// Value bound under `name`. Fails once the session is invalidated.
    pub fn get_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.ensure_usable()?;
        Ok(self.attributes.read().get(name).cloned())
    }

    /// Names of all bound attributes, in no particular order.
    pub fn attribute_names(&self) -> Result<Vec<String>> {
        self.ensure_usable()?;
        Ok(self.attributes.read().keys().cloned().collect())
    }

    /// Bind `value` under `name`.
    ///
    /// Binding hooks fire only when the value differs from the one already
    /// bound under the same name.
    pub fn set_attribute(&self, name: &str, value: impl Into<AttributeValue>) -> Result<()> {
        self.ensure_usable()?;
        let value = value.into();
        if self.context.is_distributable() && !value.is_serializable() {
            return Err(Error::NotSerializable {
                name: name.to_string(),
            });
        }

        let rebinding = self
            .attributes
            .read()
            .get(name)
            .is_some_and(|prior| prior.same_binding(&value));
        if !rebinding
            && let AttributeValue::Object(obj) = &value
            && let Err(e) = obj.value_bound(self, name)
        {
            warn!(session_id = %self.id(), attribute = %name, error = %e, "Value bound hook failed");
        }

        let old = self
            .attributes
            .write()
            .insert(name.to_string(), value.clone());

        match old {
            Some(old) => {
                if !old.same_binding(&value)
                    && let AttributeValue::Object(obj) = &old
                    && let Err(e) = obj.value_unbound(self, name)
                {
                    warn!(session_id = %self.id(), attribute = %name, error = %e, "Value unbound hook failed");
                }
                self.context
                    .fire_attribute(Notification::AttributeReplaced, self, name, &old);
            }
            None => {
                self.context
                    .fire_attribute(Notification::AttributeAdded, self, name, &value);
            }
        }
        Ok(())
    }

    /// Unbind `name`, firing unbind and removal notifications.
    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.ensure_usable()?;
        Ok(self.remove_attribute_internal(name, true))
    }

    fn remove_attribute_internal(&self, name: &str, notify: bool) -> Option<AttributeValue> {
        let value = self.attributes.write().remove(name)?;
        if notify {
            if let AttributeValue::Object(obj) = &value
                && let Err(e) = obj.value_unbound(self, name)
            {
                warn!(session_id = %self.id(), attribute = %name, error = %e, "Value unbound hook failed");
            }
            self.context
                .fire_attribute(Notification::AttributeRemoved, self, name, &value);
        }
        Some(value)
    }

    /// Request-scoped scratch value. Notes are never persisted.
    pub fn note(&self, name: &str) -> Option<serde_json::Value> {
        self.notes.lock().get(name).cloned()
    }

    /// Set a scratch value.
    pub fn set_note(&self, name: impl Into<String>, value: serde_json::Value) {
        self.notes.lock().insert(name.into(), value);
    }

    /// Remove a scratch value.
    pub fn remove_note(&self, name: &str) -> Option<serde_json::Value> {
        self.notes.lock().remove(name)
    }

    /// Authenticated principal for the session. Never persisted.
    pub fn principal(&self) -> Option<String> {
        self.principal.lock().clone()
    }

    /// Set or clear the authenticated principal.
    pub fn set_principal(&self, principal: Option<String>) {
        *self.principal.lock() = principal;
    }

    /// Attach a listener for this session's events.
    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.lock().push(listener);
    }

    /// Detach a listener previously passed to [`Session::add_listener`].
    pub fn remove_listener(&self, listener: &Arc<dyn SessionEventListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Capture the persistent fields as a record.
    ///
    /// Values that cannot be encoded are written as
    /// [`StoredValue::NotSerializable`].
    pub fn to_record(&self) -> SessionRecord {
        let core = self.core.lock().clone();
        let attributes: Vec<StoredAttribute> = self
            .attributes
            .read()
            .iter()
            .map(|(name, value)| StoredAttribute {
                name: name.clone(),
                value: stored_value(&core.id, name, value),
            })
            .collect();
        SessionRecord {
            version: RECORD_VERSION,
            creation_time: core.creation_time.timestamp_millis(),
            last_accessed_time: core.last_accessed_time.timestamp_millis(),
            max_inactive_interval: core.max_inactive_secs,
            is_new: core.is_new,
            is_valid: core.valid,
            this_accessed_time: core.this_accessed_time.timestamp_millis(),
            id: core.id,
            attribute_count: attributes.len() as i32,
            attributes,
        }
    }

    /// Fill a blank session from a stored record.
    ///
    /// Sentinel values are dropped. The session is left passive when the
    /// record is valid, expired otherwise. No binding hooks run.
    pub fn restore(&self, record: SessionRecord) -> Result<()> {
        let id = record.id;
        let mut attributes = HashMap::with_capacity(record.attributes.len());
        for attribute in record.attributes {
            let value = match attribute.value {
                StoredValue::Data { value } => AttributeValue::Data(value),
                StoredValue::Object { tag, payload } => {
                    let obj = self
                        .context
                        .resolver()
                        .resolve(&tag, payload)
                        .map_err(|e| Error::deserialization(&id, format!("attribute '{}': {e}", attribute.name)))?;
                    AttributeValue::Object(obj)
                }
                StoredValue::NotSerializable => {
                    trace!(session_id = %id, attribute = %attribute.name, "Dropping unencodable attribute");
                    continue;
                }
            };
            attributes.insert(attribute.name, value);
        }

        let core = SessionCore {
            creation_time: from_millis(&id, record.creation_time)?,
            last_accessed_time: from_millis(&id, record.last_accessed_time)?,
            this_accessed_time: from_millis(&id, record.this_accessed_time)?,
            max_inactive_secs: record.max_inactive_interval,
            is_new: record.is_new,
            valid: record.is_valid,
            phase: if record.is_valid {
                Phase::Passive
            } else {
                Phase::Expired
            },
            id,
        };
        *self.attributes.write() = attributes;
        *self.core.lock() = core;
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        let core = self.core.lock();
        if core.usable() {
            Ok(())
        } else {
            Err(Error::Invalidated(core.id.clone()))
        }
    }

    fn object_attributes(&self) -> Vec<(String, Arc<dyn crate::value::SessionObject>)> {
        self.attributes
            .read()
            .iter()
            .filter_map(|(name, value)| value.as_object().map(|obj| (name.clone(), Arc::clone(obj))))
            .collect()
    }

    fn fire_event(&self, event: SessionEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            if let Err(e) = listener.session_event(self, event) {
                warn!(session_id = %self.id(), event = ?event, error = %e, "Session event listener failed");
            }
        }
    }
}

fn stored_value(id: &str, name: &str, value: &AttributeValue) -> StoredValue {
    match value {
        AttributeValue::Data(value) => StoredValue::Data {
            value: value.clone(),
        },
        AttributeValue::Object(obj) => {
            let Some(tag) = obj.type_tag() else {
                return StoredValue::NotSerializable;
            };
            match obj.to_payload() {
                Ok(payload) => StoredValue::Object {
                    tag: tag.to_string(),
                    payload,
                },
                Err(e) => {
                    warn!(session_id = %id, attribute = %name, error = %e, "Attribute could not be encoded");
                    StoredValue::NotSerializable
                }
            }
        }
    }
}

fn from_millis(id: &str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::deserialization(id, format!("timestamp out of range: {ms}")))
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Session")
            .field("id", &core.id)
            .field("phase", &core.phase)
            .field("valid", &core.valid)
            .field("access_count", &self.access_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Holds a session accessed for the lifetime of a request.
///
/// Dropping the guard calls [`Session::end_access`].
pub struct AccessGuard {
    session: Arc<Session>,
}

impl AccessGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for AccessGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.session.end_access();
    }
}
