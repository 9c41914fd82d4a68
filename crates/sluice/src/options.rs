//! The options surface: everything shared across renders
//!
//! Options are built once, wrapped in an `Arc`, and treated as immutable from
//! then on. Mutating them concurrently with a render is undefined behavior as
//! far as the engine is concerned (nothing unsafe, but renders may observe a
//! torn configuration).

use crate::{
    accessor::{
        AccessorRegistry, MemberAccessStrategy, ValueConverter, classify,
    },
    encode::{HtmlEncoder, TextEncoder},
    filters::FilterRegistry,
    loader::{TemplateCache, TemplateLoader},
    parse::Parser,
    value::{HostObject, Value},
};
use chrono::{DateTime, FixedOffset};
use std::{any::Any, sync::Arc};

/// Formatting conventions for numbers. Dates always format through the
/// `date` filter's explicit format string, so culture only carries the
/// numeric separator.
#[derive(Clone, Debug)]
pub struct Culture {
    /// Separator between the integer and fractional parts, `.` by default
    pub decimal_separator: char,
}

impl Default for Culture {
    fn default() -> Self {
        Self {
            decimal_separator: '.',
        }
    }
}

/// Shared configuration for parsing and rendering: filters, converters,
/// accessors, culture, guards, and external collaborators
pub struct TemplateOptions {
    /// Named filters available to every render
    pub filters: FilterRegistry,
    /// Member accessors for opaque host objects
    pub accessors: AccessorRegistry,
    /// Host-value converters, applied in order during classification
    pub converters: Vec<ValueConverter>,
    /// Policy for member access on host objects (safe by default)
    pub member_access: MemberAccessStrategy,
    /// Number formatting conventions
    pub culture: Culture,
    /// Default zone applied when resolving the clock
    pub timezone: FixedOffset,
    /// Clock override; when unset, renders observe the real time at context
    /// creation
    pub now: Option<DateTime<FixedOffset>>,
    /// Maximum include/render nesting depth
    pub max_recursion: usize,
    /// Maximum statements evaluated per render; unlimited when unset
    pub max_steps: Option<u64>,
    /// Maximum loop iterations per render; unlimited when unset
    pub max_iterations: Option<u64>,
    /// Maximum characters of output per sink; unlimited when unset
    pub max_output: Option<usize>,
    /// Resolver for `include`/`render` child templates
    pub loader: Option<Arc<dyn TemplateLoader>>,
    /// Output escaping, HTML by default
    pub encoder: Arc<dyn TextEncoder>,
    /// Parser used for child templates loaded at render time
    pub parser: Arc<Parser>,
    /// Parsed child templates, shared across renders
    pub(crate) cache: TemplateCache,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            filters: FilterRegistry::with_builtins(),
            accessors: AccessorRegistry::new(),
            converters: Vec::new(),
            member_access: MemberAccessStrategy::default(),
            culture: Culture::default(),
            // Utc; a zero offset is always representable
            timezone: FixedOffset::east_opt(0).unwrap(),
            now: None,
            max_recursion: 100,
            max_steps: None,
            max_iterations: None,
            max_output: None,
            loader: None,
            encoder: Arc::new(HtmlEncoder),
            parser: Arc::new(Parser::new()),
            cache: TemplateCache::default(),
        }
    }
}

impl TemplateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a host value into the value system: existing values pass
    /// through, the registered converters get first crack, then shape
    /// dispatch, with anything unrecognized becoming an opaque object
    pub fn to_value<T: Any + Send + Sync>(&self, host: T) -> Value {
        self.classify(HostObject::new(host))
    }

    /// [to_value](Self::to_value) for a pre-built host object, e.g. one
    /// constructed with [HostObject::reflective]
    pub fn classify(&self, object: HostObject) -> Value {
        classify(object, &self.converters)
    }
}
