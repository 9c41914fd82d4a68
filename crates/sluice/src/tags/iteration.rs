//! Loops: `for` (with `limit`/`offset`/`reversed` and `else`), `break`,
//! `continue`, and `cycle`

use crate::{
    ast::{Control, Statement},
    context::RenderContext,
    error::{RenderError, TemplateParseError},
    expression::{Expression, Identifier},
    parse::{BlockParser, Parser, TagParser},
    render::{Output, render_statements},
    value::Value,
};

pub(crate) fn register(parser: &mut Parser) {
    parser.register_block("for", parse_for);
    parser.register_empty_tag("break", || Statement::Break);
    parser.register_empty_tag("continue", || Statement::Continue);
    parser.register_tag("cycle", parse_cycle);
}

/// `{% for x in source limit: n offset: n reversed %}`, with an optional
/// `{% else %}` body for empty sources
#[derive(Debug)]
pub struct ForStatement {
    pub(crate) variable: Identifier,
    pub(crate) source: Expression,
    pub(crate) limit: Option<Expression>,
    pub(crate) offset: Option<Expression>,
    pub(crate) reversed: bool,
    pub(crate) body: Vec<Statement>,
    pub(crate) else_body: Option<Vec<Statement>>,
}

impl ForStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        let source = self.source.evaluate(cx).await?;
        let offset = match &self.offset {
            Some(expression) => {
                expression.evaluate(cx).await?.to_integer().max(0) as usize
            }
            None => 0,
        };
        let limit = match &self.limit {
            Some(expression) => Some(
                expression.evaluate(cx).await?.to_integer().max(0) as usize,
            ),
            None => None,
        };

        // The body runs exactly min(limit, len - offset) times
        let total = source.iter().len();
        let remaining = total.saturating_sub(offset);
        let count = limit.map_or(remaining, |limit| limit.min(remaining));
        if count == 0 {
            if let Some(body) = &self.else_body {
                return render_statements(body, cx, out).await;
            }
            return Ok(Control::Normal);
        }

        // The loop variable and the loop frame die with the block
        cx.enter_scope();
        cx.push_loop(count);
        let result = self.render_rows(&source, total, offset, count, cx, out).await;
        cx.pop_loop();
        cx.exit_scope();
        result
    }

    async fn render_rows(
        &self,
        source: &Value,
        total: usize,
        offset: usize,
        count: usize,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        // `reversed` walks the same window back to front, staying lazy for
        // ranges by skipping from the far end
        let items: Box<dyn Iterator<Item = Value> + Send + '_> =
            if self.reversed {
                Box::new(
                    source
                        .iter()
                        .rev()
                        .skip(total - offset - count)
                        .take(count),
                )
            } else {
                Box::new(source.iter().skip(offset).take(count))
            };

        for (index0, item) in items.enumerate() {
            // Loop iteration boundary: guard counter and cancellation check
            cx.charge_iteration()?;
            cx.set_loop_index(index0);
            cx.set_variable(self.variable.as_str(), item);
            match render_statements(&self.body, cx, out).await? {
                Control::Normal => {}
                Control::Continue => {}
                Control::Break => break,
                Control::Terminate => return Ok(Control::Terminate),
            }
        }
        Ok(Control::Normal)
    }
}

fn parse_for(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    let variable = tag.expect_identifier()?;
    tag.expect_keyword("in")?;
    let source = tag.expect_expression()?;

    let mut limit = None;
    let mut offset = None;
    let mut reversed = false;
    loop {
        if tag.accept_keyword("limit") {
            tag.expect_char(':')?;
            limit = Some(tag.expect_value()?);
        } else if tag.accept_keyword("offset") {
            tag.expect_char(':')?;
            offset = Some(tag.expect_value()?);
        } else if tag.accept_keyword("reversed") {
            reversed = true;
        } else {
            break;
        }
    }

    let (body, stop) = block.parse_until(&["else", "endfor"])?;
    let else_body = if stop.name() == "else" {
        let (body, _) = block.parse_until(&["endfor"])?;
        Some(body)
    } else {
        None
    };

    Ok(Statement::For(ForStatement {
        variable,
        source,
        limit,
        offset,
        reversed,
        body,
        else_body,
    }))
}

/// `{% cycle 'a', 'b' %}` or `{% cycle group: 'a', 'b' %}`: emit the next
/// value in rotation each time the tag renders. Ungrouped cycles with the
/// same source text share one rotation; a group expression keys the rotation
/// explicitly.
#[derive(Debug)]
pub struct CycleStatement {
    pub(crate) group: Option<Expression>,
    pub(crate) values: Vec<Expression>,
    /// State key for ungrouped cycles: the tag's own source text
    pub(crate) key: String,
}

impl CycleStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        let key = match &self.group {
            Some(expression) => expression.evaluate(cx).await?.to_string(),
            None => self.key.clone(),
        };
        let index = cx.cycle_next(&key, self.values.len());
        let value = self.values[index].evaluate(cx).await?;
        out.write_value(&value, cx)?;
        Ok(Control::Normal)
    }
}

fn parse_cycle(
    tag: &mut TagParser<'_>,
) -> Result<Statement, TemplateParseError> {
    let key = tag.source().trim().to_owned();
    let first = tag.expect_value()?;
    let (group, mut values) = if tag.accept_char(':') {
        (Some(first), vec![tag.expect_value()?])
    } else {
        (None, vec![first])
    };
    while tag.accept_char(',') {
        values.push(tag.expect_value()?);
    }
    Ok(Statement::Cycle(CycleStatement { group, values, key }))
}
