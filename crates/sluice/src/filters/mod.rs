//! Named filters and their registry
//!
//! Filters transform the value on the left of a `|` in an output pipeline.
//! They receive the input value, an argument bundle, and a shared borrow of
//! the context (so they can read culture and resolve members, but can never
//! mutate scopes). Invocation is a suspension point; most built-ins complete
//! synchronously through the ready-future adapter.

mod array;
mod math;
mod misc;
mod string;

use crate::{
    context::RenderContext,
    error::RenderError,
    value::{Arguments, Value},
};
use futures::future::{self, BoxFuture};
use indexmap::IndexMap;
use std::sync::Arc;

/// A named transform applied in an output or expression pipeline
pub trait Filter: Send + Sync {
    fn apply<'a>(
        &'a self,
        input: Value,
        arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>>;
}

/// Adapter wrapping a plain synchronous function as a [Filter]
struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: Fn(Value, Arguments) -> Result<Value, RenderError> + Send + Sync,
{
    fn apply<'a>(
        &'a self,
        input: Value,
        arguments: Arguments,
        _cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        Box::pin(future::ready((self.0)(input, arguments)))
    }
}

/// Filters keyed by name. Registration is last-writer-wins, so hosts can
/// shadow a built-in by registering over it.
#[derive(Default)]
pub struct FilterRegistry {
    filters: IndexMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// An empty registry, with no built-ins
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the full built-in filter set
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        array::register(&mut registry);
        math::register(&mut registry);
        misc::register(&mut registry);
        string::register(&mut registry);
        registry
    }

    /// Register a filter under a name, replacing any existing registration
    pub fn register(
        &mut self,
        name: impl Into<String>,
        filter: impl Filter + 'static,
    ) {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    /// Register a plain synchronous function as a filter
    pub fn register_fn<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(Value, Arguments) -> Result<Value, RenderError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnFilter(filter));
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn Filter>> {
        self.filters.get(name)
    }
}

/// Interpret a filter input as an array: arrays pass through, ranges
/// materialize, nil is `None` (filters pass nil through unchanged, the
/// usual Liquid leniency), anything else is a type error.
fn as_array(input: &Value) -> Result<Option<Vec<Value>>, RenderError> {
    match input {
        Value::Nil => Ok(None),
        Value::Array(items) => Ok(Some(items.clone())),
        Value::Range(_) => Ok(Some(input.iter().collect())),
        _ => Err(RenderError::Type {
            expected: "array",
            actual: input.type_name(),
        }),
    }
}
