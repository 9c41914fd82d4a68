//! Statement nodes and the rendered template
//!
//! Every statement renders against a context, writing into an output sink and
//! returning a completion signal. Completion signals are plain return values,
//! never exceptions: `break`/`continue` are hot-path events in loops.

use crate::{
    context::RenderContext,
    error::RenderError,
    expression::{Expression, Identifier},
    render::{Output, render_statements},
    tags::{
        flow::{CaseStatement, IfStatement},
        iteration::{CycleStatement, ForStatement},
        template::IncludeStatement,
        variable::{AssignStatement, CaptureStatement},
    },
};
use futures::future::BoxFuture;
use std::{fmt::Debug, sync::Arc};

/// How a statement finished rendering. `Break` and `Continue` propagate up
/// until the nearest enclosing loop absorbs them; `Terminate` halts the whole
/// render.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Control {
    Normal,
    Break,
    Continue,
    Terminate,
}

/// A parsed, immutable tree of statements. Templates hold no mutable state,
/// so one template can be rendered any number of times, concurrently, each
/// render against its own context.
#[derive(Debug)]
pub struct Template {
    statements: Vec<Statement>,
}

impl Template {
    pub(crate) fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// The top-level statement sequence
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Render this template against a context, producing the output
    /// document. A `Terminate` signal (cancellation, guard trips, custom
    /// tags) stops rendering; whatever was written up to that point is
    /// returned or, for error terminations, discarded into the error.
    pub async fn render(
        &self,
        cx: &mut RenderContext,
    ) -> Result<String, RenderError> {
        let mut out = Output::new(cx.output_limit());
        let _ = render_statements(&self.statements, cx, &mut out).await?;
        Ok(out.into_string())
    }

    /// Render into an existing output sink, propagating the completion
    /// signal. This is the entry point child templates use.
    pub(crate) async fn render_into(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        render_statements(&self.statements, cx, out).await
    }
}

/// A user-defined leaf tag's runtime behavior. Registered tags build custom
/// statements at parse time; at render time the statement gets the full
/// context and output sink, and returns a completion signal like any
/// built-in.
pub trait CustomTag: Debug + Send + Sync {
    fn render<'a>(
        &'a self,
        cx: &'a mut RenderContext,
        out: &'a mut Output,
    ) -> BoxFuture<'a, Result<Control, RenderError>>;
}

/// One node of a parsed template
#[derive(Debug)]
pub enum Statement {
    /// A verbatim byte range from the source, written without escaping
    Text(Arc<str>),
    /// `{{ expr }}`: evaluate, stringify, write through the encoder
    Output(OutputStatement),
    /// `{% if %}`/`{% elsif %}`/`{% else %}`, and `{% unless %}`
    If(IfStatement),
    /// `{% case %}`/`{% when %}`/`{% else %}`
    Case(CaseStatement),
    /// `{% for %}` with `limit`/`offset`/`reversed` and an optional `else`
    For(ForStatement),
    /// `{% cycle %}`, with an optional group name
    Cycle(CycleStatement),
    /// `{% assign x = expr %}`
    Assign(AssignStatement),
    /// `{% capture x %}...{% endcapture %}`
    Capture(CaptureStatement),
    /// `{% increment x %}`: output the counter, then add one
    Increment(Identifier),
    /// `{% decrement x %}`: subtract one, then output the counter
    Decrement(Identifier),
    /// `{% break %}`
    Break,
    /// `{% continue %}`
    Continue,
    /// `{% include 'name' %}`: render a child template sharing this scope
    Include(IncludeStatement),
    /// `{% render 'name' %}`: render a child template in an isolated scope
    RenderPartial(IncludeStatement),
    /// A registered user tag
    Custom(Arc<dyn CustomTag>),
}

impl Statement {
    /// Render this statement, writing into the output sink and returning a
    /// completion signal. Statements that touch no async boundary complete
    /// on first poll; boxing happens only at this recursion seam.
    pub(crate) fn render<'a>(
        &'a self,
        cx: &'a mut RenderContext,
        out: &'a mut Output,
    ) -> BoxFuture<'a, Result<Control, RenderError>> {
        Box::pin(async move {
            match self {
                Self::Text(text) => {
                    out.write_raw(text)?;
                    Ok(Control::Normal)
                }
                Self::Output(statement) => statement.render(cx, out).await,
                Self::If(statement) => statement.render(cx, out).await,
                Self::Case(statement) => statement.render(cx, out).await,
                Self::For(statement) => statement.render(cx, out).await,
                Self::Cycle(statement) => statement.render(cx, out).await,
                Self::Assign(statement) => statement.render(cx).await,
                Self::Capture(statement) => statement.render(cx, out).await,
                Self::Increment(name) => {
                    let value = cx.increment(name.as_str());
                    out.write_raw(&value.to_string())?;
                    Ok(Control::Normal)
                }
                Self::Decrement(name) => {
                    let value = cx.decrement(name.as_str());
                    out.write_raw(&value.to_string())?;
                    Ok(Control::Normal)
                }
                Self::Break => Ok(Control::Break),
                Self::Continue => Ok(Control::Continue),
                Self::Include(statement) => {
                    statement.render(cx, out, false).await
                }
                Self::RenderPartial(statement) => {
                    statement.render(cx, out, true).await
                }
                Self::Custom(tag) => tag.render(cx, out).await,
            }
        })
    }
}

/// `{{ expr }}`: the expression result is stringified and passed through the
/// context's encoder exactly once. Pre-escaped markup bypasses the encoder.
#[derive(Debug)]
pub struct OutputStatement {
    pub(crate) expression: Expression,
}

impl OutputStatement {
    async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        let value = self.expression.evaluate(cx).await?;
        out.write_value(&value, cx)?;
        Ok(Control::Normal)
    }
}
