//! Typed Properties
//!
//! Scalar property holders with defaults, immutability, a native/graph dual
//! representation and change tracking against a committed snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::PropertyError;
use crate::value::Value;

// ============================================================================
// Representation and Value Sources
// ============================================================================

/// Which side of the mapping a resolved value is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Representation {
    /// Values as application code sees them.
    #[default]
    Native,
    /// Values as they are written into query parameters.
    Graph,
}

/// A zero-argument value producer, e.g. "now".
#[derive(Clone)]
pub struct Producer(Arc<dyn Fn() -> Value + Send + Sync>);

impl Producer {
    pub fn new(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn now() -> Self {
        Self::new(|| Value::DateTime(Utc::now()))
    }

    pub fn call(&self) -> Value {
        (self.0)()
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Producer(..)")
    }
}

#[derive(Debug, Clone)]
pub enum ValueSource {
    Fixed(Value),
    Producer(Producer),
}

impl ValueSource {
    pub fn resolve(&self) -> Value {
        match self {
            ValueSource::Fixed(v) => v.clone(),
            ValueSource::Producer(p) => p.call(),
        }
    }
}

impl From<Value> for ValueSource {
    fn from(v: Value) -> Self {
        ValueSource::Fixed(v)
    }
}

impl From<Producer> for ValueSource {
    fn from(p: Producer) -> Self {
        ValueSource::Producer(p)
    }
}

// ============================================================================
// Property Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
    /// Immutable, defaults to the current time.
    TimeStamp,
    /// Integer whose graph representation is one more than its value.
    Increment,
}

impl PropertyKind {
    /// Kind used for an undeclared property assigned `value`.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(_) => Some(PropertyKind::Boolean),
            Value::String(_) => Some(PropertyKind::String),
            Value::Integer(_) => Some(PropertyKind::Integer),
            Value::Float(_) => Some(PropertyKind::Float),
            Value::DateTime(_) => Some(PropertyKind::DateTime),
            Value::Null | Value::List(_) | Value::Map(_) => None,
        }
    }

    fn fallback(&self) -> Value {
        match self {
            PropertyKind::Integer | PropertyKind::Increment => Value::Integer(0),
            PropertyKind::Float => Value::Float(0.0),
            PropertyKind::Boolean => Value::Bool(false),
            PropertyKind::String | PropertyKind::DateTime | PropertyKind::TimeStamp => Value::Null,
        }
    }

    pub fn to_native(&self, value: Value) -> Value {
        match self {
            PropertyKind::String => match value {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s),
                Value::Bool(b) => Value::String(b.to_string()),
                Value::Integer(i) => Value::String(i.to_string()),
                Value::Float(f) => Value::String(f.to_string()),
                Value::DateTime(dt) => Value::String(dt.to_rfc3339()),
                other => serde_json::to_string(&other)
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            },
            PropertyKind::Integer | PropertyKind::Increment => match value {
                Value::Integer(i) => Value::Integer(i),
                Value::Float(f) => Value::Integer(f.trunc() as i64),
                Value::Bool(b) => Value::Integer(b as i64),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|f| Value::Integer(f.trunc() as i64))
                    .unwrap_or_else(|_| self.fallback()),
                Value::DateTime(dt) => Value::Integer(dt.timestamp()),
                _ => self.fallback(),
            },
            PropertyKind::Float => match value {
                Value::Float(f) => Value::Float(f),
                Value::Integer(i) => Value::Float(i as f64),
                Value::Bool(b) => Value::Float(if b { 1.0 } else { 0.0 }),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .unwrap_or_else(|_| self.fallback()),
                Value::DateTime(dt) => Value::Float(epoch_seconds(&dt)),
                _ => self.fallback(),
            },
            PropertyKind::Boolean => match value {
                Value::Bool(b) => Value::Bool(b),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    other => Value::Bool(!other.is_empty()),
                },
                Value::Integer(i) => Value::Bool(i != 0),
                Value::Float(f) => Value::Bool(f != 0.0),
                Value::List(l) => Value::Bool(!l.is_empty()),
                Value::Map(m) => Value::Bool(!m.is_empty()),
                Value::DateTime(_) => Value::Bool(true),
                Value::Null => self.fallback(),
            },
            PropertyKind::DateTime | PropertyKind::TimeStamp => match value {
                Value::DateTime(dt) => Value::DateTime(dt),
                Value::Integer(i) => from_epoch_seconds(i as f64),
                Value::Float(f) => from_epoch_seconds(f),
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
        }
    }

    pub fn to_graph(&self, value: Value) -> Value {
        match (self, self.to_native(value)) {
            (PropertyKind::DateTime | PropertyKind::TimeStamp, Value::DateTime(dt)) => {
                Value::Float(epoch_seconds(&dt))
            }
            (PropertyKind::Increment, Value::Integer(i)) => Value::Integer(i.saturating_add(1)),
            (_, native) => native,
        }
    }

    pub fn render(&self, value: Value, repr: Representation) -> Value {
        match repr {
            Representation::Native => self.to_native(value),
            Representation::Graph => self.to_graph(value),
        }
    }
}

fn epoch_seconds(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

fn from_epoch_seconds(secs: f64) -> Value {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;

    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
        .map(Value::DateTime)
        .unwrap_or(Value::Null)
}

// ============================================================================
// Property
// ============================================================================

#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    kind: PropertyKind,
    value: Option<ValueSource>,
    original: Value,
    default: Option<ValueSource>,
    immutable: bool,
    inferred: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        let (default, immutable) = match kind {
            PropertyKind::TimeStamp => (Some(ValueSource::Producer(Producer::now())), true),
            _ => (None, false),
        };

        Self {
            name: name.into(),
            kind,
            value: None,
            original: Value::Null,
            default,
            immutable,
            inferred: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(ValueSource::Fixed(default.into()));
        self
    }

    pub fn with_default_producer(mut self, producer: Producer) -> Self {
        self.default = Some(ValueSource::Producer(producer));
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    fn inferred(mut self) -> Self {
        self.inferred = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn is_inferred(&self) -> bool {
        self.inferred
    }

    /// Assign a new value. Returns `false` (and does nothing) when the
    /// property is immutable.
    pub fn set(&mut self, value: impl Into<Value>) -> bool {
        self.set_source(ValueSource::Fixed(value.into()))
    }

    pub fn set_source(&mut self, source: ValueSource) -> bool {
        if self.immutable {
            return false;
        }

        self.value = Some(source);
        true
    }

    fn force_set(&mut self, source: Option<ValueSource>) {
        self.value = source;
    }

    /// Current value as assigned, producers invoked, no defaults or coercion.
    pub fn raw(&self) -> Value {
        self.value.as_ref().map(ValueSource::resolve).unwrap_or_default()
    }

    pub fn original(&self) -> &Value {
        &self.original
    }

    /// Fully resolved value: defaults applied, producers invoked, coerced.
    pub fn value(&self, repr: Representation) -> Value {
        let mut value = self.raw();

        if value.is_null() {
            if let Some(default) = &self.default {
                value = default.resolve();
            }
        }

        self.kind.render(value, repr)
    }

    pub fn is_changed(&self) -> bool {
        self.kind.to_native(self.raw()) != self.kind.to_native(self.original.clone())
    }

    /// Make the current value the new baseline.
    pub fn commit(&mut self) {
        let current = self.raw();

        if self.value.is_some() {
            self.value = Some(ValueSource::Fixed(current.clone()));
        }
        self.original = current;
    }

    /// Revert to the committed baseline.
    pub fn reset(&mut self) {
        self.value = if self.original.is_null() {
            None
        } else {
            Some(ValueSource::Fixed(self.original.clone()))
        };
    }
}

/// One entry of [`PropertyManager::changed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    pub from: Value,
    pub to: Value,
}

// ============================================================================
// Property Manager
// ============================================================================

/// Ordered property bag of one entity.
#[derive(Debug, Clone, Default)]
pub struct PropertyManager {
    properties: BTreeMap<String, Property>,
    allow_undefined: bool,
}

impl PropertyManager {
    pub fn new(allow_undefined: bool) -> Self {
        Self {
            properties: BTreeMap::new(),
            allow_undefined,
        }
    }

    pub fn with_properties(
        properties: impl IntoIterator<Item = Property>,
        allow_undefined: bool,
    ) -> Self {
        let mut manager = Self::new(allow_undefined);
        for property in properties {
            manager.declare(property);
        }
        manager
    }

    pub fn declare(&mut self, property: Property) {
        self.properties.insert(property.name.clone(), property);
    }

    pub fn allow_undefined(&self) -> bool {
        self.allow_undefined
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Native value of `name`, or `None` when it is not declared.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.properties
            .get(name)
            .map(|p| p.value(Representation::Native))
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), PropertyError> {
        let value = value.into();
        let kind_hint = value.clone();
        self.set_source(name, ValueSource::Fixed(value), &kind_hint)
    }

    pub fn set_producer(&mut self, name: &str, producer: Producer) -> Result<(), PropertyError> {
        let sample = producer.call();
        self.set_source(name, ValueSource::Producer(producer), &sample)
    }

    fn set_source(
        &mut self,
        name: &str,
        source: ValueSource,
        sample: &Value,
    ) -> Result<(), PropertyError> {
        if let Some(property) = self.properties.get_mut(name) {
            property.set_source(source);
            return Ok(());
        }

        if !self.allow_undefined {
            return Ok(());
        }

        let kind = PropertyKind::infer(sample).ok_or_else(|| PropertyError::UninferableType {
            field: name.to_string(),
            value_type: sample.type_name(),
        })?;

        let mut property = Property::new(name, kind).inferred();
        property.set_source(source);
        self.properties.insert(name.to_string(), property);

        Ok(())
    }

    /// Drop a property. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.properties.remove(name).is_some()
    }

    /// Every property resolved for `repr`, sorted by name. Nulls are omitted.
    pub fn data(&self, repr: Representation) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .map(|(name, p)| (name.clone(), p.value(repr)))
            .filter(|(_, v)| !v.is_null())
            .collect()
    }

    /// Properties whose current value differs from the committed snapshot.
    pub fn changed(&self) -> BTreeMap<String, PropertyChange> {
        self.properties
            .iter()
            .filter(|(_, p)| p.is_changed())
            .map(|(name, p)| {
                (
                    name.clone(),
                    PropertyChange {
                        from: p.kind.to_native(p.original.clone()),
                        to: p.kind.to_native(p.raw()),
                    },
                )
            })
            .collect()
    }

    pub fn commit(&mut self) {
        for property in self.properties.values_mut() {
            property.commit();
        }
    }

    pub fn reset(&mut self) {
        for property in self.properties.values_mut() {
            property.reset();
        }
    }

    /// Apply `values`. With `reset` the values replace the current data and
    /// become the new change-tracking baseline (the load path); without it
    /// they are ordinary assignments.
    pub fn hydrate<I, K>(&mut self, values: I, reset: bool) -> Result<(), PropertyError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: BTreeMap<String, Value> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();

        if !reset {
            if self.allow_undefined {
                for (name, value) in &values {
                    if !self.contains(name) && PropertyKind::infer(value).is_none() {
                        return Err(PropertyError::UninferableType {
                            field: name.clone(),
                            value_type: value.type_name(),
                        });
                    }
                }
            }
            for (name, value) in values {
                self.set(&name, value)?;
            }
            return Ok(());
        }

        self.properties
            .retain(|name, p| !p.inferred || values.contains_key(name));

        for property in self.properties.values_mut() {
            property.force_set(None);
        }

        for (name, value) in values {
            if let Some(property) = self.properties.get_mut(&name) {
                property.force_set(Some(ValueSource::Fixed(value)));
                continue;
            }

            if !self.allow_undefined {
                continue;
            }

            match PropertyKind::infer(&value) {
                Some(kind) => {
                    let mut property = Property::new(name.as_str(), kind).inferred();
                    property.force_set(Some(ValueSource::Fixed(value)));
                    self.properties.insert(name, property);
                }
                None => {
                    warn!(
                        "⚠️  Skipping undeclared property `{}` with uninferable {} value",
                        name,
                        value.type_name()
                    );
                }
            }
        }

        self.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_manager() -> PropertyManager {
        PropertyManager::new(true)
    }

    #[test]
    fn test_immutable_assignment_is_a_noop() {
        let mut p = Property::new("code", PropertyKind::String).immutable();

        assert!(!p.set("abc"));
        assert_eq!(p.raw(), Value::Null);
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let p = Property::new("status", PropertyKind::String).with_default("active");

        assert_eq!(p.value(Representation::Native), Value::from("active"));
        assert_eq!(p.raw(), Value::Null);
    }

    #[test]
    fn test_producer_values_are_invoked() {
        let mut manager = open_manager();
        manager
            .set_producer("answer", Producer::new(|| Value::Integer(42)))
            .unwrap();

        assert_eq!(manager.get("answer"), Some(Value::Integer(42)));
        assert_eq!(
            manager.property("answer").map(Property::kind),
            Some(PropertyKind::Integer)
        );
    }

    #[test]
    fn test_inference_from_assigned_value() {
        let mut manager = open_manager();
        manager.set("flag", true).unwrap();
        manager.set("name", "mark").unwrap();
        manager.set("age", 33).unwrap();
        manager.set("score", 1.5).unwrap();
        manager.set("seen", Utc::now()).unwrap();

        let kind = |n: &str| manager.property(n).map(Property::kind);
        assert_eq!(kind("flag"), Some(PropertyKind::Boolean));
        assert_eq!(kind("name"), Some(PropertyKind::String));
        assert_eq!(kind("age"), Some(PropertyKind::Integer));
        assert_eq!(kind("score"), Some(PropertyKind::Float));
        assert_eq!(kind("seen"), Some(PropertyKind::DateTime));
    }

    #[test]
    fn test_uninferable_value_is_an_error() {
        let mut manager = open_manager();
        let err = manager
            .set("tags", Value::List(vec![Value::from("a")]))
            .unwrap_err();

        assert!(matches!(
            err,
            PropertyError::UninferableType { ref field, value_type: "list" } if field == "tags"
        ));
        assert!(!manager.contains("tags"));
    }

    #[test]
    fn test_hydrate_without_reset_applies_nothing_on_uninferable_value() {
        let mut manager = open_manager();
        manager.hydrate([("name", Value::from("mark"))], true).unwrap();

        let err = manager
            .hydrate(
                [
                    ("age", Value::Integer(33)),
                    ("name", Value::from("someone")),
                    ("tags", Value::List(vec![])),
                ],
                false,
            )
            .unwrap_err();

        assert!(matches!(err, PropertyError::UninferableType { ref field, .. } if field == "tags"));
        assert_eq!(manager.get("name"), Some(Value::from("mark")));
        assert!(!manager.contains("age"));
        assert!(manager.changed().is_empty());
    }

    #[test]
    fn test_undefined_property_ignored_when_disallowed() {
        let mut manager = PropertyManager::new(false);
        manager.set("anything", "value").unwrap();

        assert_eq!(manager.get("anything"), None);
        assert!(manager.data(Representation::Native).is_empty());
    }

    #[test]
    fn test_data_is_sorted_and_skips_nulls() {
        let mut manager = PropertyManager::with_properties(
            [
                Property::new("zeta", PropertyKind::String),
                Property::new("alpha", PropertyKind::Integer),
            ],
            true,
        );
        manager.set("middle", "m").unwrap();

        let data = manager.data(Representation::Native);
        let keys: Vec<&str> = data.keys().map(String::as_str).collect();

        assert_eq!(keys, vec!["alpha", "middle"]);
        assert_eq!(data["alpha"], Value::Integer(0));
    }

    #[test]
    fn test_changed_tracks_against_snapshot() {
        let mut manager = open_manager();
        manager
            .hydrate([("name", Value::from("mark"))], true)
            .unwrap();
        assert!(manager.changed().is_empty());

        manager.set("name", "someone").unwrap();
        let changed = manager.changed();
        assert_eq!(changed.len(), 1);
        assert_eq!(
            changed["name"],
            PropertyChange {
                from: Value::from("mark"),
                to: Value::from("someone"),
            }
        );

        manager.set("name", "mark").unwrap();
        assert!(manager.changed().is_empty());
    }

    #[test]
    fn test_hydrate_reset_overrides_immutable_and_clears_inferred() {
        let mut manager = PropertyManager::with_properties(
            [Property::new("created", PropertyKind::TimeStamp)],
            true,
        );
        manager.set("extra", "x").unwrap();

        manager
            .hydrate([("created", Value::Float(1_700_000_000.0))], true)
            .unwrap();

        assert!(!manager.contains("extra"));
        assert_eq!(
            manager.property("created").map(Property::raw),
            Some(Value::Float(1_700_000_000.0))
        );
        assert!(manager.changed().is_empty());
    }

    #[test]
    fn test_reset_restores_snapshot() {
        let mut manager = open_manager();
        manager.hydrate([("name", Value::from("a"))], true).unwrap();
        manager.set("name", "b").unwrap();

        manager.reset();

        assert_eq!(manager.get("name"), Some(Value::from("a")));
    }

    #[test]
    fn test_graph_representation() {
        assert_eq!(
            PropertyKind::Increment.to_graph(Value::Integer(4)),
            Value::Integer(5)
        );
        assert_eq!(
            PropertyKind::Increment.to_graph(Value::Integer(i64::MAX)),
            Value::Integer(i64::MAX)
        );
        assert_eq!(
            PropertyKind::DateTime.to_graph(Value::Float(10.5)),
            Value::Float(10.5)
        );
        assert_eq!(
            PropertyKind::Boolean.to_native(Value::from(" TRUE ")),
            Value::Bool(true)
        );
        assert_eq!(
            PropertyKind::Integer.to_native(Value::from("12.9")),
            Value::Integer(12)
        );
    }

    #[test]
    fn test_timestamp_defaults_to_now_and_is_immutable() {
        let mut p = Property::new("created", PropertyKind::TimeStamp);

        assert!(p.is_immutable());
        assert!(!p.set(Value::Float(1.0)));
        assert!(matches!(
            p.value(Representation::Native),
            Value::DateTime(_)
        ));
        assert!(matches!(p.value(Representation::Graph), Value::Float(_)));
    }
}
