//! Expression definitions and evaluation

use crate::{
    context::RenderContext,
    error::RenderError,
    value::{Arguments, RangeValue, Value},
};
use derive_more::{Deref, Display};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// A name that can appear in a template: a variable, member, filter, or
/// keyword argument. A valid identifier is any non-empty string of
/// alphanumeric characters, `-`, or `_` whose first character is a letter or
/// underscore.
#[derive(Clone, Debug, Deref, Display, Eq, Hash, PartialEq)]
pub struct Identifier(pub(crate) String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Is the character allowed in an identifier?
    pub(crate) fn is_char_allowed(c: char) -> bool {
        Self::is_char_allowed_first(c) || c.is_numeric() || c == '-'
    }

    /// Is the character allowed as the first character in an identifier?
    pub(crate) fn is_char_allowed_first(c: char) -> bool {
        c.is_alphabetic() || c == '_'
    }
}

/// A shortcut for creating identifiers from static strings. Since the string
/// is defined in code we're assuming it's valid.
impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A dynamic segment of a template, computed at render time against the
/// context. Expressions never suspend except at member/index access, filter
/// invocation, and function calls.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    /// A literal value such as `3`, `false`, or `'hello'`
    Literal(Literal),
    /// Variable lookup through the scope stack, falling back to the model
    Identifier(Identifier),
    /// Member access: `a.b`. Chains without bound
    Member {
        object: Box<Self>,
        name: Identifier,
    },
    /// Index access: `a[expr]`
    Index {
        object: Box<Self>,
        index: Box<Self>,
    },
    /// Inclusive integer range: `(1..5)`. Bounds are themselves expressions
    Range {
        start: Box<Self>,
        end: Box<Self>,
    },
    /// Comparison or logical operator. `and`/`or` have no mutual precedence
    /// and associate right-to-left, per Liquid
    Binary {
        operator: BinaryOperator,
        lhs: Box<Self>,
        rhs: Box<Self>,
    },
    /// Filter application: `expr | name: arg, key: arg`. Left-associative
    Filter {
        input: Box<Self>,
        call: FilterCall,
    },
    /// Invocation of a function value: `fn(1, key: 2)`
    Call(FunctionCall),
}

/// Literal primitive value
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Nil,
    Boolean(bool),
    Number(Decimal),
    String(String),
    Empty,
    Blank,
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Nil => Value::Nil,
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Empty => Value::Empty,
            Literal::Blank => Value::Blank,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Contains,
    And,
    Or,
}

/// A filter in an output pipeline: `| name: arg1, key: arg2`
#[derive(Clone, Debug, PartialEq)]
pub struct FilterCall {
    pub(crate) name: Identifier,
    /// Positional arguments
    pub(crate) position: Vec<Expression>,
    /// Keyword arguments. Must be an `IndexMap` so evaluation order matches
    /// lexical order
    pub(crate) keyword: IndexMap<Identifier, Expression>,
}

/// An invocation of a function value: `f(true, 0, mode: 'caps')`
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionCall {
    pub(crate) target: Identifier,
    pub(crate) position: Vec<Expression>,
    pub(crate) keyword: IndexMap<Identifier, Expression>,
}

impl Expression {
    /// Evaluate this expression to a value. Unresolved names, members, and
    /// indexes are `Nil`, never errors; filters and function calls can fail.
    pub(crate) fn evaluate<'a>(
        &'a self,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        // Box for recursion
        Box::pin(async move {
            match self {
                Self::Literal(literal) => Ok(literal.into()),
                Self::Identifier(name) => Ok(cx.resolve(name).await),
                Self::Member { object, name } => {
                    let object = object.evaluate(cx).await?;
                    Ok(cx.member(&object, name).await)
                }
                Self::Index { object, index } => {
                    let object = object.evaluate(cx).await?;
                    let index = index.evaluate(cx).await?;
                    Ok(cx.index(&object, &index).await)
                }
                Self::Range { start, end } => {
                    let start = start.evaluate(cx).await?.to_integer();
                    let end = end.evaluate(cx).await?.to_integer();
                    Ok(RangeValue::new(start, end).into())
                }
                Self::Binary { operator, lhs, rhs } => {
                    evaluate_binary(*operator, lhs, rhs, cx).await
                }
                Self::Filter { input, call } => {
                    let input = input.evaluate(cx).await?;
                    call.apply(input, cx).await
                }
                Self::Call(call) => call.invoke(cx).await,
            }
        })
    }
}

/// Evaluate a binary operator. `and`/`or` short-circuit; comparisons between
/// unorderable types are false rather than errors.
async fn evaluate_binary(
    operator: BinaryOperator,
    lhs: &Expression,
    rhs: &Expression,
    cx: &RenderContext,
) -> Result<Value, RenderError> {
    use BinaryOperator::*;

    let lhs = lhs.evaluate(cx).await?;
    let result = match operator {
        And => lhs.to_bool() && rhs.evaluate(cx).await?.to_bool(),
        Or => lhs.to_bool() || rhs.evaluate(cx).await?.to_bool(),
        operator => {
            let rhs = rhs.evaluate(cx).await?;
            match operator {
                Equal => lhs.equals(&rhs),
                NotEqual => !lhs.equals(&rhs),
                Less => lhs.compare(&rhs) == Some(Ordering::Less),
                LessEqual => matches!(
                    lhs.compare(&rhs),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                Greater => lhs.compare(&rhs) == Some(Ordering::Greater),
                GreaterEqual => matches!(
                    lhs.compare(&rhs),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                Contains => lhs.contains(&rhs),
                And | Or => unreachable!("handled above"),
            }
        }
    };
    Ok(Value::Boolean(result))
}

impl FilterCall {
    /// Evaluate arguments and apply the named filter to the input value
    async fn apply(
        &self,
        input: Value,
        cx: &RenderContext,
    ) -> Result<Value, RenderError> {
        let filter = cx.filters().get(&self.name).ok_or_else(|| {
            RenderError::FilterUnknown {
                name: self.name.to_string(),
            }
        })?;
        let arguments =
            evaluate_arguments(&self.position, &self.keyword, cx)
                .await
                .map_err(|error| error.in_filter(self.name.as_str()))?;
        filter
            .apply(input, arguments, cx)
            .await
            .map_err(|error| error.in_filter(self.name.as_str()))
    }
}

impl FunctionCall {
    /// Resolve the target name and invoke it, if it's a function value
    async fn invoke(&self, cx: &RenderContext) -> Result<Value, RenderError> {
        let target = cx.resolve(&self.target).await;
        let Value::Function(function) = target else {
            return Err(RenderError::NotCallable {
                name: self.target.to_string(),
            });
        };
        let arguments =
            evaluate_arguments(&self.position, &self.keyword, cx).await?;
        function.invoke(arguments, cx).await
    }
}

/// Evaluate positional and keyword argument expressions, left to right. An
/// argument failing to evaluate is tagged with its position or name.
async fn evaluate_arguments(
    position: &[Expression],
    keyword: &IndexMap<Identifier, Expression>,
    cx: &RenderContext,
) -> Result<Arguments, RenderError> {
    let mut evaluated = Vec::with_capacity(position.len());
    for (index, expression) in position.iter().enumerate() {
        let value = expression
            .evaluate(cx)
            .await
            .map_err(|error| error.in_argument(index))?;
        evaluated.push(value);
    }
    let mut keywords = IndexMap::with_capacity(keyword.len());
    for (name, expression) in keyword {
        let value = expression
            .evaluate(cx)
            .await
            .map_err(|error| error.in_argument(name))?;
        keywords.insert(name.to_string(), value);
    }
    Ok(Arguments::new(evaluated, keywords))
}
