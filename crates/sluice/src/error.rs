//! Error types for the two failure domains: parsing and rendering

use std::fmt::Display;
use thiserror::Error;
use winnow::error::{ContextError, ParseError};

/// An error while parsing a template. Carries the byte offset of the failure
/// within the original source so callers can point at the offending spot.
/// Parse errors are surfaced synchronously from the parser and are never
/// raised during rendering.
#[derive(Debug, Error)]
#[error("parse error at byte {offset}: {message}")]
pub struct TemplateParseError {
    offset: usize,
    message: String,
}

impl TemplateParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }

    /// Byte offset into the source template where parsing failed
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Convert winnow's error type into ours. The offset winnow reports is
    /// relative to the slice it was handed, so the caller supplies the base
    /// offset of that slice within the full template.
    pub(crate) fn from_winnow(
        error: &ParseError<&str, ContextError>,
        base: usize,
    ) -> Self {
        Self {
            offset: base + error.offset(),
            message: error.inner().to_string(),
        }
    }
}

/// Any error that can occur during template rendering.
///
/// The error always holds owned data so it can be detached from the lifetime
/// of the template and context. This requires a mild amount of cloning in
/// error cases, but those should be infrequent so it's fine.
///
/// These error messages are often shown with additional parent context, so
/// they should be pretty brief.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A filter was invoked that isn't in the registry
    #[error("unknown filter `{name}`")]
    FilterUnknown { name: String },

    /// Context wrapper: an error occurred while applying a named filter
    #[error("in filter `{name}`")]
    Filter {
        name: String,
        #[source]
        error: Box<Self>,
    },

    /// Call syntax was applied to a value that isn't a function
    #[error("`{name}` is not callable")]
    NotCallable { name: String },

    /// Not enough positional arguments provided to a filter or function
    #[error("not enough arguments")]
    TooFewArguments,

    /// Arguments were passed but never consumed by the implementation
    #[error("unexpected arguments: {unexpected}")]
    TooManyArguments { unexpected: String },

    /// Context wrapper: an argument failed to convert to the expected type
    #[error("argument `{name}`")]
    Argument {
        name: String,
        #[source]
        error: Box<Self>,
    },

    /// A value of one type was given where another was required
    #[error("type error: expected {expected}, got {actual}")]
    Type {
        expected: &'static str,
        actual: &'static str,
    },

    /// Division or modulo by zero in an arithmetic filter
    #[error("division by zero")]
    DivisionByZero,

    /// The loader could not resolve a template name to a path
    #[error("template `{name}` not found")]
    TemplateNotFound { name: String },

    /// The loader resolved a path but failed to produce its source
    #[error("error loading template `{name}`")]
    Loader {
        name: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A child template loaded at render time failed to parse
    #[error("error parsing template `{name}`")]
    TemplateParse {
        name: String,
        #[source]
        error: TemplateParseError,
    },

    /// Include/render nesting exceeded the configured depth
    #[error("include depth exceeded maximum of {max}")]
    RecursionLimit { max: usize },

    /// A template included itself somewhere along the current include chain
    #[error("cyclic include of template `{name}`")]
    CyclicInclude { name: String },

    /// The render evaluated more statements than the configured maximum
    #[error("render exceeded maximum of {max} steps")]
    StepLimit { max: u64 },

    /// Loops in this render iterated more than the configured maximum
    #[error("render exceeded maximum of {max} loop iterations")]
    IterationLimit { max: u64 },

    /// The rendered output grew past the configured character budget
    #[error("output exceeded maximum of {max} characters")]
    OutputLimit { max: usize },

    /// The cancellation signal was tripped
    #[error("render cancelled")]
    Cancelled,

    /// External error type, e.g. from a custom filter or loader
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl RenderError {
    /// Create a [RenderError::Other] from another error
    pub fn other(
        error: impl 'static + Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Other(error.into())
    }

    /// Create a [RenderError::Other] from a plain message
    pub fn message(message: impl Display) -> Self {
        Self::Other(message.to_string().into())
    }

    /// Wrap this error with the name of the filter that triggered it
    pub(crate) fn in_filter(self, name: impl Into<String>) -> Self {
        Self::Filter {
            name: name.into(),
            error: Box::new(self),
        }
    }

    /// Wrap this error with the name or index of the offending argument
    pub(crate) fn in_argument(self, name: impl Display) -> Self {
        Self::Argument {
            name: name.to_string(),
            error: Box::new(self),
        }
    }
}
