//! The evaluator: statement traversal and the output sink

use crate::{
    ast::{Control, Statement},
    context::RenderContext,
    error::RenderError,
    value::Value,
};

/// The sink statements write into. Tracks the rendered character count
/// against the configured output budget; exceeding it aborts the render.
#[derive(Debug)]
pub struct Output {
    buffer: String,
    /// Characters written so far
    written: usize,
    limit: Option<usize>,
}

impl Output {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            buffer: String::new(),
            written: 0,
            limit,
        }
    }

    /// Write text without escaping: raw template text and pre-escaped markup
    pub fn write_raw(&mut self, text: &str) -> Result<(), RenderError> {
        self.buffer.push_str(text);
        self.charge(text.chars().count())
    }

    /// Write an expression result. The value is stringified with the
    /// context's culture and passed through the encoder exactly once;
    /// markup values and nil skip the encoder entirely.
    pub fn write_value(
        &mut self,
        value: &Value,
        cx: &RenderContext,
    ) -> Result<(), RenderError> {
        match value {
            // Nothing to write, nothing to encode
            Value::Nil | Value::Empty | Value::Blank => Ok(()),
            Value::Markup(markup) => self.write_raw(markup),
            value => {
                let text = cx.format_value(value);
                let start = self.buffer.len();
                cx.encoder().encode(&mut self.buffer, &text);
                let added = self.buffer[start..].chars().count();
                self.charge(added)
            }
        }
    }

    /// Rendered output so far
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub(crate) fn into_string(self) -> String {
        self.buffer
    }

    fn charge(&mut self, chars: usize) -> Result<(), RenderError> {
        self.written += chars;
        match self.limit {
            Some(max) if self.written > max => {
                Err(RenderError::OutputLimit { max })
            }
            _ => Ok(()),
        }
    }
}

/// Render a statement sequence front to back, short-circuiting on any
/// non-`Normal` completion. Output is written strictly in source order: a
/// suspended statement completes before the next begins, and siblings are
/// never evaluated in parallel.
pub(crate) async fn render_statements(
    statements: &[Statement],
    cx: &mut RenderContext,
    out: &mut Output,
) -> Result<Control, RenderError> {
    for statement in statements {
        // Statement boundary: guard counter and cancellation check
        cx.charge_step()?;
        match statement.render(cx, out).await? {
            Control::Normal => {}
            control => return Ok(control),
        }
    }
    Ok(Control::Normal)
}
