//! Built-in tags and blocks
//!
//! Each submodule owns its statement shapes: parsing from the tag grammar
//! and rendering against the context. User tags register through the same
//! [Parser](crate::Parser) surface these built-ins use.

pub mod flow;
pub mod iteration;
pub mod template;
pub mod variable;

use crate::parse::Parser;

/// Register the full built-in tag set into a parser's grammar table
pub(crate) fn register_builtins(parser: &mut Parser) {
    flow::register(parser);
    iteration::register(parser);
    template::register(parser);
    variable::register(parser);
}
