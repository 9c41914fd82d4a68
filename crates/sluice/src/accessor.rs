//! Bridge from host data into the template namespace
//!
//! Templates never reach into host types on their own. Member access on an
//! opaque [HostObject] consults an [AccessorRegistry]: given (host type,
//! member name) it yields a getter or nothing. Host values entering the value
//! system are classified through an ordered converter chain.

use crate::value::{HostObject, Value};
use arc_swap::ArcSwap;
use chrono::{DateTime, FixedOffset, Utc};
use futures::future::{self, BoxFuture};
use indexmap::IndexMap;
use rust_decimal::{Decimal, prelude::FromPrimitive};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    collections::HashSet,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::warn;

/// Policy for member access on opaque host objects
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MemberAccessStrategy {
    /// Only explicitly registered accessors resolve, plus
    /// [ObjectMembers](crate::value::ObjectMembers) lookups for types allowed
    /// via [AccessorRegistry::allow_members]
    #[default]
    Safe,
    /// Any host object that implements
    /// [ObjectMembers](crate::value::ObjectMembers) exposes its members
    /// without registration
    Unsafe,
}

/// A resolver from a host object plus member name to a value. Accessors never
/// fail; a missing member is `Nil`. The async form is the primary contract;
/// synchronous getters are wrapped into ready futures.
pub trait Accessor: Send + Sync {
    fn get<'a>(
        &'a self,
        object: &'a HostObject,
        name: &'a str,
    ) -> BoxFuture<'a, Value>;
}

/// Adapter for a synchronous getter on a concrete host type
struct FnAccessor<T, F> {
    getter: F,
    host: PhantomData<fn() -> T>,
}

impl<T, F> Accessor for FnAccessor<T, F>
where
    T: Any + Send + Sync,
    F: Fn(&T, &str) -> Value + Send + Sync,
{
    fn get<'a>(
        &'a self,
        object: &'a HostObject,
        name: &'a str,
    ) -> BoxFuture<'a, Value> {
        let value = object
            .downcast_ref::<T>()
            .map(|host| (self.getter)(host, name))
            .unwrap_or_default();
        Box::pin(future::ready(value))
    }
}

/// Registry of member accessors, keyed by host type and member name.
/// Registries are expected to be configured once and then treated as
/// immutable; resolved getters (including misses) are cached per
/// (type, name) under copy-on-write so reads stay lock-free.
#[derive(Default)]
pub struct AccessorRegistry {
    /// (type, member) -> getter
    getters: HashMap<TypeId, HashMap<String, Arc<dyn Accessor>>>,
    /// Per-type fallback consulted when no named getter matches
    defaults: HashMap<TypeId, Arc<dyn Accessor>>,
    /// Types whose `ObjectMembers` impl may be used under the safe strategy
    allowed_members: HashSet<TypeId>,
    /// Resolution cache. Replaced wholesale under the mutex on miss; readers
    /// never block.
    cache: ArcSwap<HashMap<(TypeId, String), Option<Arc<dyn Accessor>>>>,
    cache_write: Mutex<()>,
}

impl AccessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a getter for one member of a host type
    pub fn register<T, F>(&mut self, name: impl Into<String>, getter: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.register_accessor::<T>(
            name,
            FnAccessor::<T, _> {
                getter: move |host: &T, _: &str| getter(host),
                host: PhantomData,
            },
        );
    }

    /// Register a getter consulted for every member of a host type that has
    /// no named getter
    pub fn register_default<T, F>(&mut self, getter: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T, &str) -> Value + Send + Sync + 'static,
    {
        self.defaults.insert(
            TypeId::of::<T>(),
            Arc::new(FnAccessor::<T, _> {
                getter,
                host: PhantomData,
            }),
        );
        self.invalidate();
    }

    /// Register a full [Accessor] implementation for one member of a host
    /// type. Use this for getters that need to await something.
    pub fn register_accessor<T: Any>(
        &mut self,
        name: impl Into<String>,
        accessor: impl Accessor + 'static,
    ) {
        self.getters
            .entry(TypeId::of::<T>())
            .or_default()
            .insert(name.into(), Arc::new(accessor));
        self.invalidate();
    }

    /// Permit `ObjectMembers` lookups for a host type under the safe access
    /// strategy
    pub fn allow_members<T: Any>(&mut self) {
        self.allowed_members.insert(TypeId::of::<T>());
    }

    pub(crate) fn is_members_allowed(&self, type_id: TypeId) -> bool {
        self.allowed_members.contains(&type_id)
    }

    /// Look up the getter for (type, name), consulting the cache first
    pub(crate) fn resolve(
        &self,
        type_id: TypeId,
        name: &str,
    ) -> Option<Arc<dyn Accessor>> {
        if let Some(cached) =
            self.cache.load().get(&(type_id, name.to_owned()))
        {
            return cached.clone();
        }

        let resolved = self
            .getters
            .get(&type_id)
            .and_then(|members| members.get(name))
            .or_else(|| self.defaults.get(&type_id))
            .cloned();

        // Copy-on-write insert: clone the map, add the entry (hit or miss),
        // swap it in. Writes are serialized by the mutex; readers keep using
        // the previous map until the swap.
        let _guard = self
            .cache_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut updated: HashMap<_, _> = (**self.cache.load()).clone();
        updated.insert((type_id, name.to_owned()), resolved.clone());
        self.cache.store(Arc::new(updated));

        resolved
    }

    fn invalidate(&mut self) {
        self.cache.store(Arc::new(HashMap::new()));
    }
}

/// Outcome of a value converter
pub enum Converted {
    /// Terminal: use this runtime value
    Value(Value),
    /// Re-run classification on a substitute host object
    Substitute(HostObject),
}

/// A host-value-to-runtime-value converter, applied in registration order
/// during classification. Return `None` to pass.
pub type ValueConverter =
    Arc<dyn Fn(&HostObject) -> Option<Converted> + Send + Sync>;

/// Substitution chains longer than this are treated as opaque objects rather
/// than looping forever
const MAX_SUBSTITUTIONS: usize = 8;

/// Classify a host value into the value system. Ordered chain: an existing
/// [Value] passes through; registered converters get first crack (first
/// non-`None` wins, substitutes restart the chain); otherwise dispatch on the
/// host's runtime shape; anything unrecognized stays an opaque object.
pub(crate) fn classify(
    object: HostObject,
    converters: &[ValueConverter],
) -> Value {
    let mut current = object;
    for _ in 0..MAX_SUBSTITUTIONS {
        if let Some(value) = current.downcast_ref::<Value>() {
            return value.clone();
        }
        match converters.iter().find_map(|convert| convert(&current)) {
            Some(Converted::Value(value)) => return value,
            Some(Converted::Substitute(substitute)) => {
                current = substitute;
                continue;
            }
            None => return classify_shape(current),
        }
    }
    warn!(
        type_name = current.type_name(),
        "value converter substitution chain too long; treating as object"
    );
    Value::Object(current)
}

/// Dispatch on the runtime shape of an unconverted host value
fn classify_shape(object: HostObject) -> Value {
    /// Try to downcast to each listed type, mapping matches into a value
    macro_rules! dispatch {
        ($($type:ty => $map:expr,)*) => {
            $(
                if let Some(host) = object.downcast_ref::<$type>() {
                    return ($map)(host.clone());
                }
            )*
        };
    }

    dispatch! {
        bool => Value::Boolean,
        i32 => |i: i32| Value::Number(i.into()),
        i64 => |i: i64| Value::Number(i.into()),
        u32 => |u: u32| Value::Number(u.into()),
        u64 => |u: u64| Value::Number(u.into()),
        usize => |u: usize| Value::Number(u.into()),
        f32 => |f: f32| {
            Value::Number(Decimal::from_f32(f).unwrap_or_default())
        },
        f64 => |f: f64| {
            Value::Number(Decimal::from_f64(f).unwrap_or_default())
        },
        Decimal => Value::Number,
        String => Value::String,
        &'static str => |s: &str| Value::String(s.to_owned()),
        char => |c: char| Value::String(c.to_string()),
        DateTime<FixedOffset> => Value::DateTime,
        DateTime<Utc> => |dt: DateTime<Utc>| Value::DateTime(dt.fixed_offset()),
        Vec<Value> => Value::Array,
        IndexMap<String, Value> => Value::Dictionary,
        // Generic mappings with non-string keys: coerce keys to strings
        Vec<(Value, Value)> => |pairs: Vec<(Value, Value)>| {
            Value::Dictionary(
                pairs
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect(),
            )
        },
        serde_json::Value => Value::from_json,
    }

    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectMembers;
    use rstest::rstest;

    #[derive(Debug)]
    struct Widget {
        name: &'static str,
    }

    #[rstest]
    #[case::bool(true, Value::Boolean(true))]
    #[case::integer(42_i64, Value::Number(42.into()))]
    #[case::float(1.5_f64, Value::Number("1.5".parse().unwrap()))]
    #[case::string("hi".to_owned(), "hi".into())]
    #[case::json(
        serde_json::json!({"a": [1, 2]}),
        Value::from(vec![("a", Value::from(vec![1, 2]))]),
    )]
    fn test_classify_shapes(
        #[case] host: impl Any + Send + Sync,
        #[case] expected: Value,
    ) {
        let value = classify(HostObject::new(host), &[]);
        assert_eq!(value, expected);
    }

    /// Unrecognized types become opaque objects that stringify to their type
    /// name
    #[test]
    fn test_classify_opaque() {
        let value = classify(HostObject::new(Widget { name: "w" }), &[]);
        assert_eq!(value.to_string(), "Widget");
    }

    /// Converters run in order, first non-None wins, substitutes restart
    #[test]
    fn test_converter_chain() {
        let pass: ValueConverter = Arc::new(|_| None);
        let substitute: ValueConverter = Arc::new(|object| {
            object.downcast_ref::<Widget>().map(|widget| {
                Converted::Substitute(HostObject::new(widget.name.to_owned()))
            })
        });
        let value = classify(
            HostObject::new(Widget { name: "converted" }),
            &[pass, substitute],
        );
        // The substituted String restarted classification and hit the shape
        // dispatch
        assert_eq!(value, "converted".into());
    }

    /// Getter resolution caches both hits and misses
    #[test]
    fn test_registry_resolution() {
        let mut registry = AccessorRegistry::new();
        registry.register::<Widget, _>("name", |widget| widget.name.into());
        let type_id = TypeId::of::<Widget>();

        assert!(registry.resolve(type_id, "name").is_some());
        assert!(registry.resolve(type_id, "bogus").is_none());
        // Second lookups hit the cache
        assert!(registry.resolve(type_id, "name").is_some());
        assert!(registry.resolve(type_id, "bogus").is_none());
        assert_eq!(registry.cache.load().len(), 2);
    }

    /// Wildcard accessors catch members with no named getter
    #[tokio::test]
    async fn test_default_accessor() {
        let mut registry = AccessorRegistry::new();
        registry.register_default::<Widget, _>(|widget, name| match name {
            "name" => widget.name.into(),
            _ => Value::Nil,
        });
        let object = HostObject::new(Widget { name: "w" });
        let accessor = registry
            .resolve(TypeId::of::<Widget>(), "name")
            .expect("default accessor should resolve");
        assert_eq!(accessor.get(&object, "name").await, "w".into());
        // Accessors never error; missing members are nil
        assert_eq!(accessor.get(&object, "bogus").await, Value::Nil);
    }

    impl ObjectMembers for Widget {
        fn get_member(&self, name: &str) -> Value {
            match name {
                "name" => self.name.into(),
                _ => Value::Nil,
            }
        }
    }

    #[test]
    fn test_allow_members() {
        let mut registry = AccessorRegistry::new();
        assert!(!registry.is_members_allowed(TypeId::of::<Widget>()));
        registry.allow_members::<Widget>();
        assert!(registry.is_members_allowed(TypeId::of::<Widget>()));
    }
}
