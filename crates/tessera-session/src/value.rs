//! Attribute values and the decode-side type resolver.
//!
//! Plain data is stored as [`AttributeValue::Data`] and is always encodable.
//! Richer values implement [`SessionObject`]; they opt into persistence by
//! returning a type tag, and a [`ValueResolver`] supplied by the container
//! turns `(tag, payload)` back into an object when a record is read.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::session::Session;

/// A custom object stored as a session attribute.
///
/// Every hook has a no-op default. Hook failures are logged by the session
/// and never abort the surrounding operation.
pub trait SessionObject: Any + Send + Sync + fmt::Debug {
    /// Tag used to look up the decoder when the value is read back.
    ///
    /// `None` marks the value as not serializable.
    fn type_tag(&self) -> Option<&str> {
        None
    }

    /// Encoded form of the value.
    fn to_payload(&self) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("value has no encoded form")
    }

    /// Called when the value is bound to `session` under `name`.
    fn value_bound(&self, _session: &Session, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the value is unbound from `session`.
    fn value_unbound(&self, _session: &Session, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before the owning session is written out and leaves memory.
    fn will_passivate(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the owning session has been restored into memory.
    fn did_activate(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Encode a serde value as a [`SessionObject`] payload.
pub fn encode_payload<T: Serialize>(value: &T) -> anyhow::Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Value bound to a session attribute name.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Plain data.
    Data(serde_json::Value),
    /// Custom object with lifecycle hooks.
    Object(Arc<dyn SessionObject>),
}

impl AttributeValue {
    /// Wrap a custom object.
    pub fn object<T: SessionObject>(value: T) -> Self {
        Self::Object(Arc::new(value))
    }

    /// The plain data, if this is a data value.
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    /// The object, if this is an object value.
    pub fn as_object(&self) -> Option<&Arc<dyn SessionObject>> {
        match self {
            Self::Object(obj) => Some(obj),
            Self::Data(_) => None,
        }
    }

    /// Downcast an object value to its concrete type.
    pub fn downcast_ref<T: SessionObject>(&self) -> Option<&T> {
        let obj = self.as_object()?;
        let any: &dyn Any = &**obj;
        any.downcast_ref::<T>()
    }

    /// Whether the value can be written to a store.
    pub fn is_serializable(&self) -> bool {
        match self {
            Self::Data(_) => true,
            Self::Object(obj) => obj.type_tag().is_some(),
        }
    }

    /// Whether `other` is the same bound value (identity for objects,
    /// equality for data).
    pub(crate) fn same_binding(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Data(a), Self::Data(b)) => a == b,
            _ => false,
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Data(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Data(serde_json::Value::from(value))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Data(serde_json::Value::from(value))
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Data(serde_json::Value::from(value))
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Data(serde_json::Value::from(value))
    }
}

/// Turns a stored `(tag, payload)` pair back into an object.
pub trait ValueResolver: Send + Sync {
    fn resolve(&self, tag: &str, payload: serde_json::Value)
    -> anyhow::Result<Arc<dyn SessionObject>>;
}

type Decoder =
    Box<dyn Fn(serde_json::Value) -> anyhow::Result<Arc<dyn SessionObject>> + Send + Sync>;

/// Resolver backed by a table of registered serde types.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `tag`, decoding payloads with serde.
    pub fn register<T>(self, tag: impl Into<String>) -> Self
    where
        T: SessionObject + DeserializeOwned,
    {
        self.register_with(tag, |payload| {
            let value: T = serde_json::from_value(payload)?;
            Ok(Arc::new(value) as Arc<dyn SessionObject>)
        })
    }

    /// Register a custom decoder under `tag`.
    pub fn register_with<F>(mut self, tag: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(serde_json::Value) -> anyhow::Result<Arc<dyn SessionObject>> + Send + Sync + 'static,
    {
        self.decoders.insert(tag.into(), Box::new(decoder));
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}

impl ValueResolver for TypeRegistry {
    fn resolve(
        &self,
        tag: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<Arc<dyn SessionObject>> {
        match self.decoders.get(tag) {
            Some(decoder) => decoder(payload),
            None => anyhow::bail!("no decoder registered for type tag '{tag}'"),
        }
    }
}
