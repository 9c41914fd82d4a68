//! Render Liquid-family templates against host data. Templates are parsed
//! once into an immutable statement tree and rendered many times, each
//! render against its own context, with context-sensitive escaping on the
//! way out.
//!
//! Liquid is a safe templating language: templates cannot invoke arbitrary
//! code. They evaluate a restricted expression grammar, dereference named
//! variables through a controlled accessor layer, and may invoke a fixed set
//! of built-in or registered filters.
//!
//! ```
//! use sluice::{Parser, RenderContext, TemplateOptions, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let parser = Parser::new();
//! let template = parser.parse("Hello {{ name }}!")?;
//!
//! let options = Arc::new(TemplateOptions::default());
//! let model = Value::from(vec![("name", "World")]);
//! let mut cx = RenderContext::new(model, options);
//! assert_eq!(template.render(&mut cx).await?, "Hello World!");
//! # Ok(())
//! # }
//! ```
//!
//! File-system resolution of includes, web-framework integration, and
//! configuration loading are out of scope; the evaluator reaches child
//! templates only through the [TemplateLoader] interface.

mod accessor;
mod ast;
mod context;
mod encode;
mod error;
mod expression;
mod filters;
mod loader;
mod options;
mod parse;
mod render;
pub mod tags;
#[cfg(test)]
mod tests;
mod value;

pub use accessor::{
    Accessor, AccessorRegistry, Converted, MemberAccessStrategy,
    ValueConverter,
};
pub use ast::{Control, CustomTag, OutputStatement, Statement, Template};
pub use context::RenderContext;
pub use encode::{HtmlEncoder, NullEncoder, TextEncoder, UrlEncoder};
pub use error::{RenderError, TemplateParseError};
pub use expression::{
    BinaryOperator, Expression, FilterCall, FunctionCall, Identifier, Literal,
};
pub use filters::{Filter, FilterRegistry};
pub use loader::{MemoryLoader, TemplateKind, TemplateLoader};
pub use options::{Culture, TemplateOptions};
pub use parse::{BlockParser, BlockTag, Parser, TagParser};
pub use render::Output;
// Numbers are scale-preserving decimals; re-export so hosts can construct
// them without depending on rust_decimal directly
pub use rust_decimal::Decimal;
pub use value::{
    Arguments, FunctionValue, HostObject, ObjectMembers, RangeValue,
    TemplateFunction, TryFromValue, Value, ValueIter,
};
