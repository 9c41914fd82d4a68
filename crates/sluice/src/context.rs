//! Per-render mutable state
//!
//! A [RenderContext] is created for one render and destroyed with it; it is
//! never shared across concurrent renders. It threads the scope stack, loop
//! frames, counters, guards, culture, and encoder through the statement walk.

use crate::{
    accessor::{AccessorRegistry, MemberAccessStrategy},
    ast::Template,
    encode::TextEncoder,
    error::RenderError,
    filters::FilterRegistry,
    loader::TemplateKind,
    options::{Culture, TemplateOptions},
    value::{HostObject, Value},
};
use chrono::{DateTime, FixedOffset, Utc};
use indexmap::IndexMap;
use std::{any::Any, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// State for one `for` loop, used to build the `forloop` object and track
/// the current position
#[derive(Copy, Clone, Debug)]
pub(crate) struct LoopFrame {
    pub index0: usize,
    pub length: usize,
}

/// Everything a single render mutates: variable scopes, loop frames,
/// counters, guard state, plus read-only handles to the shared options
pub struct RenderContext {
    options: Arc<TemplateOptions>,
    /// Context-level accessors, consulted before the options registry
    accessors: AccessorRegistry,
    /// The implicit root for unresolved names
    model: Value,
    /// Innermost scope last. Writes target the innermost scope; reads search
    /// outward. Push/pop is balanced by block boundaries.
    scopes: Vec<IndexMap<String, Value>>,
    loops: Vec<LoopFrame>,
    /// `increment`/`decrement` counters, a namespace of their own
    counters: IndexMap<String, i64>,
    /// `cycle` positions, keyed by group
    cycles: IndexMap<String, usize>,
    /// Names along the current include chain, for depth and cycle detection
    include_chain: Vec<String>,
    steps: u64,
    iterations: u64,
    cancellation: CancellationToken,
    now: DateTime<FixedOffset>,
}

impl RenderContext {
    /// Create a context for one render. The model is the implicit root for
    /// names no scope defines.
    pub fn new(
        model: impl Into<Value>,
        options: Arc<TemplateOptions>,
    ) -> Self {
        let now = options
            .now
            .unwrap_or_else(|| Utc::now().with_timezone(&options.timezone));
        Self {
            options,
            accessors: AccessorRegistry::new(),
            model: model.into(),
            scopes: vec![IndexMap::new()],
            loops: Vec::new(),
            counters: IndexMap::new(),
            cycles: IndexMap::new(),
            include_chain: Vec::new(),
            steps: 0,
            iterations: 0,
            cancellation: CancellationToken::new(),
            now,
        }
    }

    /// Attach a cancellation signal. The evaluator checks it at each
    /// statement boundary and loop iteration.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    pub fn model(&self) -> &Value {
        &self.model
    }

    /// Context-level accessor registry; getters registered here override the
    /// options registry for this render only
    pub fn accessors_mut(&mut self) -> &mut AccessorRegistry {
        &mut self.accessors
    }

    /// Classify a host value using the options' converter chain
    pub fn to_value<T: Any + Send + Sync>(&self, host: T) -> Value {
        self.options.to_value(host)
    }

    // === Scopes ===

    pub(crate) fn enter_scope(&mut self) {
        self.scopes.push(IndexMap::new());
    }

    pub(crate) fn exit_scope(&mut self) {
        self.scopes.pop();
        debug_assert!(
            !self.scopes.is_empty(),
            "scope stack unbalanced: exit_scope popped the root scope"
        );
    }

    /// Current scope depth, for balance assertions in tests
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Bind a variable in the innermost scope
    pub fn set_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) {
        // A scope always exists; the root scope is never popped
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value.into());
        }
    }

    /// Resolve a name: scopes innermost-out, then the `forloop` object, then
    /// the model. Undefined names are `Nil`, never errors.
    pub(crate) async fn resolve(&self, name: &str) -> Value {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return value.clone();
            }
        }
        if name == "forloop" && !self.loops.is_empty() {
            return self.forloop_value();
        }
        self.member(&self.model, name).await
    }

    /// Resolve a member on a value. Objects go through the accessor layers;
    /// everything else resolves synchronously. Missing members are `Nil`.
    pub(crate) async fn member(&self, value: &Value, name: &str) -> Value {
        match value {
            Value::Object(object) => self.object_member(object, name).await,
            value => value.get_member(name).unwrap_or_default(),
        }
    }

    /// Resolve an index access. String indexes on objects behave like member
    /// access.
    pub(crate) async fn index(&self, value: &Value, index: &Value) -> Value {
        match (value, index) {
            (
                Value::Object(object),
                Value::String(name) | Value::Markup(name),
            ) => self.object_member(object, name).await,
            (value, index) => value.get_index(index),
        }
    }

    /// Accessor lookup: context registry first, then options, then the
    /// object's own members if the access strategy permits
    async fn object_member(&self, object: &HostObject, name: &str) -> Value {
        let type_id = object.host_type_id();
        for registry in [&self.accessors, &self.options.accessors] {
            if let Some(accessor) = registry.resolve(type_id, name) {
                return accessor.get(object, name).await;
            }
        }
        let members_allowed = match self.options.member_access {
            MemberAccessStrategy::Unsafe => true,
            MemberAccessStrategy::Safe => {
                self.accessors.is_members_allowed(type_id)
                    || self.options.accessors.is_members_allowed(type_id)
            }
        };
        if members_allowed && let Some(members) = object.members() {
            return members.get_member(name);
        }
        trace!(
            name,
            type_name = object.type_name(),
            "unresolved object member"
        );
        Value::Nil
    }

    // === Ambient ===

    pub(crate) fn filters(&self) -> &FilterRegistry {
        &self.options.filters
    }

    pub fn encoder(&self) -> &dyn TextEncoder {
        self.options.encoder.as_ref()
    }

    pub fn culture(&self) -> &Culture {
        &self.options.culture
    }

    pub fn timezone(&self) -> FixedOffset {
        self.options.timezone
    }

    /// The render's clock: the options override, or the real time observed
    /// at context creation
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.now
    }

    /// Stringify a value for output, applying the culture's numeric
    /// separator
    pub(crate) fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Number(n) => {
                let text = n.to_string();
                let separator = self.options.culture.decimal_separator;
                if separator == '.' {
                    text
                } else {
                    text.replace('.', &separator.to_string())
                }
            }
            value => value.to_string(),
        }
    }

    pub(crate) fn output_limit(&self) -> Option<usize> {
        self.options.max_output
    }

    // === Guards ===

    /// Called at every statement boundary
    pub(crate) fn charge_step(&mut self) -> Result<(), RenderError> {
        if self.cancellation.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        self.steps += 1;
        if let Some(max) = self.options.max_steps
            && self.steps > max
        {
            warn!(max, "render exceeded step limit");
            return Err(RenderError::StepLimit { max });
        }
        Ok(())
    }

    /// Called at every loop iteration
    pub(crate) fn charge_iteration(&mut self) -> Result<(), RenderError> {
        if self.cancellation.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        self.iterations += 1;
        if let Some(max) = self.options.max_iterations
            && self.iterations > max
        {
            warn!(max, "render exceeded iteration limit");
            return Err(RenderError::IterationLimit { max });
        }
        Ok(())
    }

    // === Loop frames ===

    pub(crate) fn push_loop(&mut self, length: usize) {
        self.loops.push(LoopFrame { index0: 0, length });
    }

    pub(crate) fn set_loop_index(&mut self, index0: usize) {
        if let Some(frame) = self.loops.last_mut() {
            frame.index0 = index0;
        }
    }

    pub(crate) fn pop_loop(&mut self) {
        self.loops.pop();
    }

    /// Build the `forloop` object for the innermost loop, with `parentloop`
    /// chaining outward
    pub(crate) fn forloop_value(&self) -> Value {
        Self::frame_value(&self.loops)
    }

    fn frame_value(frames: &[LoopFrame]) -> Value {
        let Some((frame, parents)) = frames.split_last() else {
            return Value::Nil;
        };
        let mut map = IndexMap::new();
        map.insert("index".to_owned(), (frame.index0 + 1).into());
        map.insert("index0".to_owned(), frame.index0.into());
        map.insert("rindex".to_owned(), (frame.length - frame.index0).into());
        map.insert(
            "rindex0".to_owned(),
            (frame.length - frame.index0 - 1).into(),
        );
        map.insert("first".to_owned(), (frame.index0 == 0).into());
        map.insert(
            "last".to_owned(),
            (frame.index0 + 1 == frame.length).into(),
        );
        map.insert("length".to_owned(), frame.length.into());
        if !parents.is_empty() {
            map.insert("parentloop".to_owned(), Self::frame_value(parents));
        }
        Value::Dictionary(map)
    }

    // === Counters and cycles ===

    /// `increment`: emit the current counter value, then add one
    pub(crate) fn increment(&mut self, name: &str) -> i64 {
        let counter = self.counters.entry(name.to_owned()).or_insert(0);
        let value = *counter;
        *counter += 1;
        value
    }

    /// `decrement`: subtract one, then emit the counter value
    pub(crate) fn decrement(&mut self, name: &str) -> i64 {
        let counter = self.counters.entry(name.to_owned()).or_insert(0);
        *counter -= 1;
        *counter
    }

    /// Advance a cycle group, returning the position to emit
    pub(crate) fn cycle_next(&mut self, key: &str, length: usize) -> usize {
        let position = self.cycles.entry(key.to_owned()).or_insert(0);
        let current = *position % length.max(1);
        *position += 1;
        current
    }

    // === Child templates ===

    /// Push a child template onto the include chain, enforcing the depth
    /// guard and detecting cycles along the current chain
    pub(crate) fn enter_partial(
        &mut self,
        name: &str,
    ) -> Result<(), RenderError> {
        let max = self.options.max_recursion;
        if self.include_chain.len() >= max {
            warn!(max, name, "include depth exceeded");
            return Err(RenderError::RecursionLimit { max });
        }
        if self.include_chain.iter().any(|entry| entry == name) {
            return Err(RenderError::CyclicInclude {
                name: name.to_owned(),
            });
        }
        self.include_chain.push(name.to_owned());
        Ok(())
    }

    pub(crate) fn exit_partial(&mut self) {
        self.include_chain.pop();
    }

    /// Resolve, load, and parse a child template through the loader, with
    /// the shared parsed-template cache
    pub(crate) async fn load_template(
        &self,
        name: &str,
    ) -> Result<Arc<Template>, RenderError> {
        let not_found = || RenderError::TemplateNotFound {
            name: name.to_owned(),
        };
        let loader = self.options.loader.as_ref().ok_or_else(not_found)?;
        let path = loader
            .resolve(name, TemplateKind::Partial)
            .await?
            .ok_or_else(not_found)?;
        if let Some(template) = self.options.cache.get(&path) {
            return Ok(template);
        }
        let source = loader.load(&path).await?;
        debug!(name, path, "parsing child template");
        self.options
            .cache
            .parse_and_insert(&path, &source, &self.options.parser)
            .map_err(|error| RenderError::TemplateParse {
                name: name.to_owned(),
                error,
            })
    }

    // === Isolation (`render` tag) ===

    /// Strip the context down to a fresh scope for an isolated child render,
    /// returning the displaced state. Guards, the include chain, and the
    /// model survive; scopes, loops, counters, and cycles do not.
    pub(crate) fn isolate(&mut self) -> IsolatedState {
        IsolatedState {
            scopes: std::mem::replace(&mut self.scopes, vec![IndexMap::new()]),
            loops: std::mem::take(&mut self.loops),
            counters: std::mem::take(&mut self.counters),
            cycles: std::mem::take(&mut self.cycles),
        }
    }

    pub(crate) fn restore(&mut self, state: IsolatedState) {
        self.scopes = state.scopes;
        self.loops = state.loops;
        self.counters = state.counters;
        self.cycles = state.cycles;
    }
}

/// Scope state displaced by an isolated (`render`) child context
pub(crate) struct IsolatedState {
    scopes: Vec<IndexMap<String, Value>>,
    loops: Vec<LoopFrame>,
    counters: IndexMap<String, i64>,
    cycles: IndexMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use sluice_util::assert_matches;

    fn context() -> RenderContext {
        RenderContext::new(
            Value::from(vec![("modeled", 1)]),
            Arc::new(TemplateOptions::default()),
        )
    }

    /// Reads search outward; writes hit the innermost scope
    #[tokio::test]
    async fn test_scope_resolution() {
        let mut cx = context();
        cx.set_variable("x", 1);
        cx.enter_scope();
        assert_eq!(cx.resolve("x").await, 1.into());
        cx.set_variable("x", 2);
        assert_eq!(cx.resolve("x").await, 2.into());
        cx.exit_scope();
        // The inner binding died with its scope
        assert_eq!(cx.resolve("x").await, 1.into());
        // Unresolved names fall through to the model, then nil
        assert_eq!(cx.resolve("modeled").await, 1.into());
        assert_eq!(cx.resolve("missing").await, Value::Nil);
    }

    /// Shadowing: scope variables hide model fields
    #[tokio::test]
    async fn test_scope_shadows_model() {
        let mut cx = context();
        cx.set_variable("modeled", "shadowed");
        assert_eq!(cx.resolve("modeled").await, "shadowed".into());
    }

    #[test]
    fn test_counters() {
        let mut cx = context();
        // increment emits then adds; decrement subtracts then emits
        assert_eq!(cx.increment("c"), 0);
        assert_eq!(cx.increment("c"), 1);
        assert_eq!(cx.decrement("c"), 1);
        assert_eq!(cx.decrement("fresh"), -1);
    }

    #[test]
    fn test_forloop_value() {
        let mut cx = context();
        cx.push_loop(3);
        cx.set_loop_index(1);
        let forloop = cx.forloop_value();
        assert_eq!(forloop.get_member("index"), Some(2.into()));
        assert_eq!(forloop.get_member("rindex"), Some(2.into()));
        assert_eq!(forloop.get_member("first"), Some(false.into()));
        assert_eq!(forloop.get_member("last"), Some(false.into()));
        assert_eq!(forloop.get_member("length"), Some(3.into()));
        assert_eq!(forloop.get_member("parentloop"), None);

        // Nested loops expose the parent frame
        cx.push_loop(2);
        let forloop = cx.forloop_value();
        let parent = forloop.get_member("parentloop").unwrap();
        assert_eq!(parent.get_member("index"), Some(2.into()));
        cx.pop_loop();
        cx.pop_loop();
    }

    #[rstest]
    #[case::depth_guard(100, "include depth exceeded")]
    fn test_include_depth_guard(
        #[case] depth: usize,
        #[case] expected: &str,
    ) {
        let mut cx = context();
        for i in 0..depth {
            cx.enter_partial(&format!("t{i}")).unwrap();
        }
        let error = cx.enter_partial("one-too-many").unwrap_err();
        assert!(error.to_string().contains(expected));
    }

    #[test]
    fn test_cyclic_include() {
        let mut cx = context();
        cx.enter_partial("a").unwrap();
        cx.enter_partial("b").unwrap();
        assert_matches!(
            cx.enter_partial("a"),
            Err(RenderError::CyclicInclude { ref name }) if name == "a",
        );
        // Leaving the chain clears the visited set
        cx.exit_partial();
        cx.exit_partial();
        cx.enter_partial("a").unwrap();
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        let mut cx = context().with_cancellation(token.clone());
        cx.charge_step().unwrap();
        token.cancel();
        assert_matches!(cx.charge_step(), Err(RenderError::Cancelled));
        assert_matches!(cx.charge_iteration(), Err(RenderError::Cancelled));
    }

    #[test]
    fn test_step_limit() {
        let options = TemplateOptions {
            max_steps: Some(2),
            ..TemplateOptions::default()
        };
        let mut cx = RenderContext::new(Value::Nil, Arc::new(options));
        cx.charge_step().unwrap();
        cx.charge_step().unwrap();
        assert_matches!(
            cx.charge_step(),
            Err(RenderError::StepLimit { max: 2 })
        );
    }
}
