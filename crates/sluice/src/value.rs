//! Runtime template values
//!
//! [Value] is the polymorphic runtime value every expression evaluates to.
//! It's a tagged sum with boxed complex variants; filters and accessors
//! dispatch on the tag rather than through inheritance.

use crate::{context::RenderContext, error::RenderError};
use chrono::{DateTime, FixedOffset};
use futures::future::{self, BoxFuture};
use indexmap::IndexMap;
use itertools::Itertools;
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use std::{
    any::{Any, TypeId},
    cmp::Ordering,
    collections::VecDeque,
    fmt::{self, Display},
    sync::Arc,
};

/// A runtime template value. This is similar to a JSON value, except:
/// - Numbers are arbitrary-precision decimals that preserve their scale
/// - Dates, lazy ranges, opaque host objects, and invocable functions are
///   supported
/// - `Empty` and `Blank` are the comparison singletons from Liquid
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(Decimal),
    String(String),
    /// A pre-escaped string. It behaves like [Value::String] everywhere
    /// except at the output sink, where it bypasses the encoder. Capture
    /// results are markup so re-emitting them never double-encodes.
    Markup(String),
    DateTime(DateTime<FixedOffset>),
    Array(Vec<Self>),
    /// Insertion-ordered mapping; iterating yields `[key, value]` pairs
    Dictionary(IndexMap<String, Self>),
    /// Opaque host value; member access goes through the accessor registry
    Object(HostObject),
    /// Integer range with inclusive bounds, enumerated lazily
    Range(RangeValue),
    /// Invocable value for macro-like host extensions
    Function(FunctionValue),
    /// The `empty` literal: equals empty strings, arrays, and dictionaries
    Empty,
    /// The `blank` literal: like `empty`, but also equals whitespace-only
    /// strings, `false`, and `nil`
    Blank,
}

impl Value {
    /// Name of this value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Markup(_) => "markup",
            Self::DateTime(_) => "date",
            Self::Array(_) => "array",
            Self::Dictionary(_) => "dictionary",
            Self::Object(_) => "object",
            Self::Range(_) => "range",
            Self::Function(_) => "function",
            Self::Empty => "empty",
            Self::Blank => "blank",
        }
    }

    /// Convert this value to a boolean, according to its truthiness. Liquid
    /// truthiness is unusual: **only** `nil` and `false` are falsy. Empty
    /// strings, empty collections, and zero are all truthy.
    pub fn to_bool(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    /// Convert this value to a number. Conversion never fails: booleans
    /// become 0/1, numeric strings are parsed, and everything else is 0.
    pub fn to_number(&self) -> Decimal {
        self.try_to_number().unwrap_or_default()
    }

    /// Convert this value to a number, or `None` if it isn't numeric
    pub fn try_to_number(&self) -> Option<Decimal> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Boolean(b) => Some(Decimal::from(u8::from(*b))),
            Self::String(s) | Self::Markup(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert this value to an integer, truncating any fraction. Non-numeric
    /// values convert to 0.
    pub fn to_integer(&self) -> i64 {
        self.to_number().trunc().to_i64().unwrap_or(0)
    }

    /// Number of items/characters in this value. Scalars have size 0.
    pub fn size(&self) -> usize {
        match self {
            Self::String(s) | Self::Markup(s) => s.chars().count(),
            Self::Array(array) => array.len(),
            Self::Dictionary(map) => map.len(),
            Self::Range(range) => range.len(),
            _ => 0,
        }
    }

    /// Compare two values for Liquid equality. Equality is symmetric and
    /// structural for collections. A number equals a string iff the string
    /// parses to the same numeric value. Scale never affects number equality:
    /// `1.0 == 1`.
    pub fn equals(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Number(n), String(s) | Markup(s))
            | (String(s) | Markup(s), Number(n)) => {
                s.trim().parse::<Decimal>().is_ok_and(|parsed| parsed == *n)
            }
            (String(a) | Markup(a), String(b) | Markup(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Array(a), Array(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Dictionary(a), Dictionary(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.get(key).is_some_and(|other| value.equals(other))
                    })
            }
            (Object(a), Object(b)) => a.ptr_eq(b),
            (Range(a), Range(b)) => a == b,
            (Function(a), Function(b)) => a.ptr_eq(b),
            // The empty/blank singletons. `blank` is a superset of `empty`
            (Empty, Empty) | (Blank, Blank) | (Empty, Blank) | (Blank, Empty) => {
                true
            }
            (String(s) | Markup(s), Empty) | (Empty, String(s) | Markup(s)) => {
                s.is_empty()
            }
            (String(s) | Markup(s), Blank) | (Blank, String(s) | Markup(s)) => {
                s.trim().is_empty()
            }
            (Array(a), Empty | Blank) | (Empty | Blank, Array(a)) => {
                a.is_empty()
            }
            (Dictionary(a), Empty | Blank) | (Empty | Blank, Dictionary(a)) => {
                a.is_empty()
            }
            (Boolean(false), Blank) | (Blank, Boolean(false)) => true,
            (Nil, Blank) | (Blank, Nil) => true,
            _ => false,
        }
    }

    /// Order two values, if they're orderable. Numbers (and numeric strings)
    /// compare numerically, strings lexicographically, dates chronologically.
    /// Cross-type comparisons yield `None`, which comparison operators treat
    /// as false.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Number(_) | Boolean(_), _) | (_, Number(_) | Boolean(_)) => {
                Some(self.try_to_number()?.cmp(&other.try_to_number()?))
            }
            (String(a) | Markup(a), String(b) | Markup(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// The `contains` operator: substring match for strings, membership for
    /// arrays and ranges, key presence for dictionaries
    pub fn contains(&self, other: &Self) -> bool {
        match self {
            Self::String(s) | Self::Markup(s) => {
                s.contains(&other.to_string())
            }
            Self::Array(array) => array.iter().any(|item| item.equals(other)),
            Self::Dictionary(map) => map.contains_key(&other.to_string()),
            Self::Range(range) => other
                .try_to_number()
                .and_then(|n| n.to_i64())
                .is_some_and(|n| range.start <= n && n <= range.end),
            _ => false,
        }
    }

    /// Resolve a member by name, for the variants that support synchronous
    /// member access. `Object` members go through the accessor registry
    /// instead (see the context), and anything unresolved is `Nil`.
    pub fn get_member(&self, name: &str) -> Option<Self> {
        match self {
            // An explicit key always wins over the built-in members
            Self::Dictionary(map) => {
                map.get(name).cloned().or_else(|| match name {
                    "size" => Some(map.len().into()),
                    _ => None,
                })
            }
            Self::Array(array) => match name {
                "size" => Some(array.len().into()),
                "first" => Some(array.first().cloned().unwrap_or_default()),
                "last" => Some(array.last().cloned().unwrap_or_default()),
                _ => None,
            },
            Self::String(s) | Self::Markup(s) => match name {
                "size" => Some(s.chars().count().into()),
                _ => None,
            },
            Self::Range(range) => match name {
                "size" => Some(range.len().into()),
                "first" => Some(range.start.into()),
                "last" => Some(range.end.into()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Resolve an index access. Arrays index by number (negative counts from
    /// the end), dictionaries by string key, ranges by position. Anything
    /// else is `Nil`.
    pub fn get_index(&self, index: &Self) -> Self {
        match self {
            Self::Array(array) => {
                lookup_position(array.len(), index)
                    .and_then(|i| array.get(i).cloned())
                    .unwrap_or_default()
            }
            Self::Dictionary(map) => {
                map.get(&index.to_string()).cloned().unwrap_or_default()
            }
            Self::Range(range) => lookup_position(range.len(), index)
                .map_or(Self::Nil, |i| (range.start + i as i64).into()),
            _ => Self::Nil,
        }
    }

    /// Iterate this value. Arrays yield their items, dictionaries yield
    /// `[key, value]` pairs, ranges count lazily. Everything else yields
    /// nothing.
    pub fn iter(&self) -> ValueIter<'_> {
        match self {
            Self::Array(array) => ValueIter::Array(array.iter()),
            Self::Dictionary(map) => ValueIter::Dictionary(map.iter()),
            Self::Range(range) => ValueIter::Range(range.start..=range.end),
            _ => ValueIter::Empty,
        }
    }

    /// Convert a JSON value to a template value. This is infallible because
    /// [Value] is a superset of JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => {
                let decimal = if let Some(i) = n.as_i64() {
                    Decimal::from(i)
                } else if let Some(u) = n.as_u64() {
                    Decimal::from(u)
                } else {
                    n.as_f64()
                        .and_then(Decimal::from_f64)
                        .unwrap_or_default()
                };
                Self::Number(decimal)
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(array) => {
                Self::Array(array.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Dictionary(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect(),
            ),
        }
    }
}

/// Stringification, as seen by `{{ }}` output and string filters. `nil` is
/// the empty string; numbers render with their scale preserved (`1.0` and `1`
/// are equal but render differently); arrays concatenate their items.
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil | Self::Empty | Self::Blank | Self::Function(_) => Ok(()),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) | Self::Markup(s) => write!(f, "{s}"),
            Self::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Array(array) => {
                for item in array {
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Self::Dictionary(map) => {
                write!(
                    f,
                    "{{{}}}",
                    map.iter().format_with(", ", |(k, v), f| f(
                        &format_args!("{k}: {v}")
                    ))
                )
            }
            Self::Object(object) => write!(f, "{}", object.type_name()),
            Self::Range(range) => write!(f, "{}..{}", range.start, range.end),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

/// Resolve a (possibly negative) index value against a collection length
fn lookup_position(len: usize, index: &Value) -> Option<usize> {
    let i = index.try_to_number()?.trunc().to_i64()?;
    let position = if i < 0 { i + len as i64 } else { i };
    (0..len as i64).contains(&position).then_some(position as usize)
}

/// An integer range with inclusive bounds: `(1..5)`. Enumerated lazily so
/// large ranges don't materialize.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
}

impl RangeValue {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of values in the range; empty if the bounds are inverted
    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Lazy iterator over a value's items. Double-ended so `reversed` loops don't
/// have to materialize their source.
pub enum ValueIter<'a> {
    Empty,
    Array(std::slice::Iter<'a, Value>),
    Dictionary(indexmap::map::Iter<'a, String, Value>),
    Range(std::ops::RangeInclusive<i64>),
}

impl ValueIter<'_> {
    /// Remaining item count. `RangeInclusive<i64>` isn't an
    /// `ExactSizeIterator`, so this is an inherent method instead.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Array(iter) => iter.len(),
            Self::Dictionary(iter) => iter.len(),
            Self::Range(range) => {
                (*range.end() - *range.start() + 1).max(0) as usize
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for ValueIter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Self::Empty => None,
            Self::Array(iter) => iter.next().cloned(),
            Self::Dictionary(iter) => iter
                .next()
                .map(|(key, value)| {
                    Value::Array(vec![key.as_str().into(), value.clone()])
                }),
            Self::Range(range) => range.next().map(Value::from),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl DoubleEndedIterator for ValueIter<'_> {
    fn next_back(&mut self) -> Option<Value> {
        match self {
            Self::Empty => None,
            Self::Array(iter) => iter.next_back().cloned(),
            Self::Dictionary(iter) => iter
                .next_back()
                .map(|(key, value)| {
                    Value::Array(vec![key.as_str().into(), value.clone()])
                }),
            Self::Range(range) => range.next_back().map(Value::from),
        }
    }
}

/// Member lookup on a host type, the Rust stand-in for "public getters". Only
/// consulted when the member access strategy permits it; the safe default
/// requires explicit accessor registration instead.
pub trait ObjectMembers: Send + Sync {
    fn get_member(&self, name: &str) -> Value;
}

/// An opaque host value. The template can hold and pass these around, but
/// member access is always mediated by the accessor registry; the engine
/// never reaches into the host type on its own.
#[derive(Clone)]
pub struct HostObject {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    members: Option<Arc<dyn ObjectMembers>>,
}

impl HostObject {
    /// Wrap a host value. Members resolve only through registered accessors.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: short_type_name::<T>(),
            members: None,
        }
    }

    /// Wrap a host value that exposes its own members via [ObjectMembers].
    /// Whether those members are reachable depends on the configured
    /// member access strategy.
    pub fn reflective<T: Any + Send + Sync + ObjectMembers>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            members: Some(value.clone() as Arc<dyn ObjectMembers>),
            value,
            type_name: short_type_name::<T>(),
        }
    }

    /// Borrow the wrapped value if it has the given type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Type id of the wrapped value, for accessor lookup
    pub fn host_type_id(&self) -> TypeId {
        (*self.value).type_id()
    }

    /// Unqualified name of the wrapped type; this is also how the object
    /// stringifies
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn members(&self) -> Option<&Arc<dyn ObjectMembers>> {
        self.members.as_ref()
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({})", self.type_name)
    }
}

/// Last path segment of a type name, e.g. `Product` for `shop::Product`
fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// An invocable planted in the template namespace by the host, called with
/// `{{ name(args) }}` syntax
pub trait TemplateFunction: Send + Sync {
    fn invoke<'a>(
        &'a self,
        arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>>;
}

/// A [TemplateFunction] boxed up as a value
#[derive(Clone)]
pub struct FunctionValue(Arc<dyn TemplateFunction>);

impl FunctionValue {
    pub fn new(function: impl TemplateFunction + 'static) -> Self {
        Self(Arc::new(function))
    }

    /// Wrap a plain synchronous closure as a template function
    pub fn from_fn<F>(function: F) -> Self
    where
        F: Fn(Arguments) -> Result<Value, RenderError> + Send + Sync + 'static,
    {
        struct FnFunction<F>(F);

        impl<F> TemplateFunction for FnFunction<F>
        where
            F: Fn(Arguments) -> Result<Value, RenderError> + Send + Sync,
        {
            fn invoke<'a>(
                &'a self,
                arguments: Arguments,
                _cx: &'a RenderContext,
            ) -> BoxFuture<'a, Result<Value, RenderError>> {
                Box::pin(future::ready((self.0)(arguments)))
            }
        }

        Self(Arc::new(FnFunction(function)))
    }

    pub(crate) async fn invoke(
        &self,
        arguments: Arguments,
        cx: &RenderContext,
    ) -> Result<Value, RenderError> {
        self.0.invoke(arguments, cx).await
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionValue")
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Decimal> for Value {
    fn from(n: Decimal) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Number(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Number(i.into())
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Self::Number(u.into())
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Self::Number(u.into())
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Self {
        Self::Number(u.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Number(Decimal::from_f64(f).unwrap_or_default())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<RangeValue> for Value {
    fn from(range: RangeValue) -> Self {
        Self::Range(range)
    }
}

impl From<HostObject> for Value {
    fn from(object: HostObject) -> Self {
        Self::Object(object)
    }
}

impl From<FunctionValue> for Value {
    fn from(function: FunctionValue) -> Self {
        Self::Function(function)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self::Dictionary(map)
    }
}

impl<T> From<Vec<T>> for Value
where
    Value: From<T>,
{
    fn from(value: Vec<T>) -> Self {
        Self::Array(value.into_iter().map(Self::from).collect())
    }
}

impl<K, V> From<Vec<(K, V)>> for Value
where
    String: From<K>,
    Value: From<V>,
{
    fn from(value: Vec<(K, V)>) -> Self {
        Self::Dictionary(
            value
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Nullable values
impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Value::from).unwrap_or_default()
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

/// Convert [Value] to a type fallibly
///
/// This is used for converting filter and function arguments to the static
/// types expected by their implementations. Conversions follow Liquid's
/// lenient coercion rules for scalars; collection conversions are strict.
pub trait TryFromValue: Sized {
    fn try_from_value(value: Value) -> Result<Self, RenderError>;
}

impl TryFromValue for Value {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        Ok(value)
    }
}

impl TryFromValue for bool {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        Ok(value.to_bool())
    }
}

impl TryFromValue for Decimal {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        value.try_to_number().ok_or(RenderError::Type {
            expected: "number",
            actual: value.type_name(),
        })
    }
}

impl TryFromValue for i64 {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        let number = Decimal::try_from_value(value)?;
        number.trunc().to_i64().ok_or(RenderError::Type {
            expected: "integer",
            actual: "number",
        })
    }
}

impl TryFromValue for usize {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        let number = Decimal::try_from_value(value)?;
        number.trunc().to_usize().ok_or(RenderError::Type {
            expected: "non-negative integer",
            actual: "number",
        })
    }
}

/// All values stringify, so this conversion is infallible in practice
impl TryFromValue for String {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        Ok(value.to_string())
    }
}

impl TryFromValue for Vec<Value> {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        match value {
            Value::Array(array) => Ok(array),
            Value::Range(range) => {
                Ok((range.start..=range.end).map(Value::from).collect())
            }
            _ => Err(RenderError::Type {
                expected: "array",
                actual: value.type_name(),
            }),
        }
    }
}

impl<T: TryFromValue> TryFromValue for Option<T> {
    fn try_from_value(value: Value) -> Result<Self, RenderError> {
        if let Value::Nil = value {
            Ok(None)
        } else {
            T::try_from_value(value).map(Some)
        }
    }
}

/// Arguments passed to a filter or function call
///
/// This container holds evaluated positional and keyword arguments. All given
/// arguments are expected to be used, and [ensure_consumed](Self::ensure_consumed)
/// should be called after extracting arguments to reject extras.
#[derive(Debug, Default)]
pub struct Arguments {
    /// Positional arguments, drained from the front as they're converted
    position: VecDeque<Value>,
    /// Number of positional arguments popped so far, for error messages
    num_popped: usize,
    /// Keyword arguments. Ordering has no impact on semantics, but an
    /// `IndexMap` keeps error messages in the order the user wrote.
    keyword: IndexMap<String, Value>,
}

impl Arguments {
    pub fn new(
        position: Vec<Value>,
        keyword: IndexMap<String, Value>,
    ) -> Self {
        Self {
            position: position.into(),
            num_popped: 0,
            keyword,
        }
    }

    /// Pop the next positional argument and convert it to `T`. Error if no
    /// positional arguments remain or the conversion fails.
    pub fn pop_position<T: TryFromValue>(&mut self) -> Result<T, RenderError> {
        let value = self
            .position
            .pop_front()
            .ok_or(RenderError::TooFewArguments)?;
        let index = self.num_popped;
        self.num_popped += 1;
        T::try_from_value(value).map_err(|error| error.in_argument(index))
    }

    /// Pop the next positional argument if there is one. Conversion failures
    /// are still errors; absence is not.
    pub fn pop_optional<T: TryFromValue>(
        &mut self,
    ) -> Result<Option<T>, RenderError> {
        if self.position.is_empty() {
            return Ok(None);
        }
        self.pop_position().map(Some)
    }

    /// Remove a keyword argument by name and convert it to `T`. Keyword
    /// arguments are inherently optional.
    pub fn pop_keyword<T: TryFromValue>(
        &mut self,
        name: &str,
    ) -> Result<Option<T>, RenderError> {
        match self.keyword.shift_remove(name) {
            Some(value) => T::try_from_value(value)
                .map(Some)
                .map_err(|error| error.in_argument(name)),
            None => Ok(None),
        }
    }

    /// Ensure all arguments were consumed. Error if the user passed arguments
    /// the implementation didn't use.
    pub fn ensure_consumed(self) -> Result<(), RenderError> {
        if self.position.is_empty() && self.keyword.is_empty() {
            Ok(())
        } else {
            let unexpected = self
                .position
                .iter()
                .map(|value| format!("`{value}`"))
                .chain(self.keyword.keys().map(|name| format!("`{name}:`")))
                .join(", ");
            Err(RenderError::TooManyArguments { unexpected })
        }
    }
}
