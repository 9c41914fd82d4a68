//! Array filters
//!
//! The property-taking filters (`map`, `where`, `sort`, `sort_natural`)
//! resolve members through the context so they work on dictionaries and on
//! opaque host objects with registered accessors. Member access can suspend,
//! so these are implemented as full [Filter]s rather than plain functions.

use super::{Filter, FilterRegistry, as_array};
use crate::{
    context::RenderContext,
    error::RenderError,
    value::{Arguments, Value},
};
use futures::future::BoxFuture;
use itertools::Itertools;
use std::cmp::Ordering;

pub(super) fn register(registry: &mut FilterRegistry) {
    registry.register_fn("compact", compact);
    registry.register_fn("first", first);
    registry.register_fn("join", join);
    registry.register_fn("last", last);
    registry.register_fn("reverse", reverse);
    registry.register_fn("size", size);
    registry.register_fn("uniq", uniq);
    registry.register("map", MapFilter);
    registry.register("sort", SortFilter { natural: false });
    registry.register("sort_natural", SortFilter { natural: true });
    registry.register("where", WhereFilter);
}

/// Drop nil items
fn compact(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    let Some(mut items) = as_array(&input)? else {
        return Ok(Value::Nil);
    };
    items.retain(|item| !matches!(item, Value::Nil));
    Ok(Value::Array(items))
}

fn first(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.iter().next().unwrap_or_default())
}

fn last(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.iter().next_back().unwrap_or_default())
}

fn join(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let separator: Option<String> = arguments.pop_optional()?;
    arguments.ensure_consumed()?;
    let separator = separator.unwrap_or_else(|| " ".into());
    let Some(items) = as_array(&input)? else {
        return Ok(Value::Nil);
    };
    Ok(items.iter().join(&separator).into())
}

fn reverse(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    let Some(mut items) = as_array(&input)? else {
        return Ok(Value::Nil);
    };
    items.reverse();
    Ok(Value::Array(items))
}

/// Item/character count of any value; scalars are 0
fn size(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.size().into())
}

/// Drop duplicate items, keeping the first occurrence of each
fn uniq(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    let Some(items) = as_array(&input)? else {
        return Ok(Value::Nil);
    };
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.iter().any(|seen| seen.equals(&item)) {
            unique.push(item);
        }
    }
    Ok(Value::Array(unique))
}

/// `map: 'key'`: project each item to one of its members
struct MapFilter;

impl Filter for MapFilter {
    fn apply<'a>(
        &'a self,
        input: Value,
        mut arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        Box::pin(async move {
            let key: String = arguments.pop_position()?;
            arguments.ensure_consumed()?;
            let Some(items) = as_array(&input)? else {
                return Ok(Value::Nil);
            };
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(cx.member(&item, &key).await);
            }
            Ok(Value::Array(mapped))
        })
    }
}

/// `where: 'key'` keeps items whose member is truthy; `where: 'key', value`
/// keeps items whose member equals the value
struct WhereFilter;

impl Filter for WhereFilter {
    fn apply<'a>(
        &'a self,
        input: Value,
        mut arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        Box::pin(async move {
            let key: String = arguments.pop_position()?;
            let expected: Option<Value> = arguments.pop_optional()?;
            arguments.ensure_consumed()?;
            let Some(items) = as_array(&input)? else {
                return Ok(Value::Nil);
            };
            let mut kept = Vec::new();
            for item in items {
                let member = cx.member(&item, &key).await;
                let keep = match &expected {
                    Some(expected) => member.equals(expected),
                    None => member.to_bool(),
                };
                if keep {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        })
    }
}

/// `sort` / `sort_natural`, optionally by a member key. Natural sorting is
/// case-insensitive.
struct SortFilter {
    natural: bool,
}

impl SortFilter {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        if self.natural {
            let a = a.to_string().to_lowercase();
            let b = b.to_string().to_lowercase();
            a.cmp(&b)
        } else {
            a.compare(b).unwrap_or(Ordering::Equal)
        }
    }
}

impl Filter for SortFilter {
    fn apply<'a>(
        &'a self,
        input: Value,
        mut arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        Box::pin(async move {
            let key: Option<String> = arguments.pop_optional()?;
            arguments.ensure_consumed()?;
            let Some(items) = as_array(&input)? else {
                return Ok(Value::Nil);
            };
            let sorted = match key {
                None => {
                    let mut items = items;
                    items.sort_by(|a, b| self.compare(a, b));
                    items
                }
                Some(key) => {
                    // Resolve each sort key once, then sort the pairs
                    let mut pairs = Vec::with_capacity(items.len());
                    for item in items {
                        let sort_key = cx.member(&item, &key).await;
                        pairs.push((sort_key, item));
                    }
                    pairs.sort_by(|(a, _), (b, _)| self.compare(a, b));
                    pairs.into_iter().map(|(_, item)| item).collect()
                }
            };
            Ok(Value::Array(sorted))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn apply(
        filter: fn(Value, Arguments) -> Result<Value, RenderError>,
        input: Value,
        position: Vec<Value>,
    ) -> Value {
        filter(input, Arguments::new(position, Default::default())).unwrap()
    }

    #[rstest]
    #[case::compact(
        compact,
        Value::Array(vec![1.into(), Value::Nil, 2.into()]),
        vec![],
        Value::from(vec![1, 2]),
    )]
    #[case::first(first, Value::from(vec![1, 2]), vec![], 1.into())]
    #[case::first_empty(first, Value::Array(vec![]), vec![], Value::Nil)]
    #[case::last(last, Value::from(vec![1, 2]), vec![], 2.into())]
    #[case::join(
        join,
        Value::from(vec!["a", "b"]),
        vec!["-".into()],
        "a-b".into(),
    )]
    #[case::join_default_separator(
        join,
        Value::from(vec!["a", "b"]),
        vec![],
        "a b".into(),
    )]
    #[case::reverse(
        reverse,
        Value::from(vec![1, 2, 3]),
        vec![],
        Value::from(vec![3, 2, 1]),
    )]
    #[case::size_array(size, Value::from(vec![1, 2, 3]), vec![], 3.into())]
    #[case::size_string(size, "hello".into(), vec![], 5.into())]
    #[case::size_scalar(size, 42.into(), vec![], 0.into())]
    #[case::uniq(
        uniq,
        Value::Array(vec![1.into(), "1".into(), 2.into(), 1.into()]),
        vec![],
        // "1" equals 1, so only the first survives
        Value::Array(vec![1.into(), 2.into()]),
    )]
    fn test_array_filter(
        #[case] filter: fn(Value, Arguments) -> Result<Value, RenderError>,
        #[case] input: Value,
        #[case] position: Vec<Value>,
        #[case] expected: Value,
    ) {
        assert_eq!(apply(filter, input, position), expected);
    }

    /// Nil passes through array filters unchanged
    #[test]
    fn test_nil_input() {
        assert_eq!(apply(compact, Value::Nil, vec![]), Value::Nil);
        assert_eq!(apply(join, Value::Nil, vec![",".into()]), Value::Nil);
    }
}
