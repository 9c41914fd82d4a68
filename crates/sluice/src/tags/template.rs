//! Child templates (`include`, `render`) and the verbatim blocks (`raw`,
//! `comment`)

use crate::{
    ast::{Control, Statement},
    context::RenderContext,
    error::{RenderError, TemplateParseError},
    expression::{Expression, Identifier},
    parse::{BlockParser, Parser, TagParser},
    render::Output,
    value::Value,
};
use indexmap::IndexMap;

pub(crate) fn register(parser: &mut Parser) {
    parser.register_tag("include", parse_include);
    parser.register_tag("render", parse_render);
    parser.register_block("raw", parse_raw);
    parser.register_block("comment", parse_comment);
}

/// `{% include 'name', a: 1 %}` / `{% render 'name', a: 1 %}`. The name is
/// an expression, so it can be computed. Parameters bind in the child scope.
#[derive(Debug)]
pub struct IncludeStatement {
    pub(crate) name: Expression,
    pub(crate) parameters: IndexMap<Identifier, Expression>,
}

impl IncludeStatement {
    /// Render the child template. `include` shares the parent scope stack;
    /// `render` isolates the child, exposing only the parameters and the
    /// model. Both count against the same include-depth and cycle guards.
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
        isolate: bool,
    ) -> Result<Control, RenderError> {
        let name = self.name.evaluate(cx).await?.to_string();

        // Parameters reference the parent scope, so evaluate them before
        // any isolation
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for (key, expression) in &self.parameters {
            parameters.push((key.to_string(), expression.evaluate(cx).await?));
        }

        cx.enter_partial(&name)?;
        let result = self
            .render_child(&name, parameters, cx, out, isolate)
            .await;
        cx.exit_partial();
        result
    }

    async fn render_child(
        &self,
        name: &str,
        parameters: Vec<(String, Value)>,
        cx: &mut RenderContext,
        out: &mut Output,
        isolate: bool,
    ) -> Result<Control, RenderError> {
        let template = cx.load_template(name).await?;
        if isolate {
            let saved = cx.isolate();
            for (key, value) in parameters {
                cx.set_variable(key, value);
            }
            let result = template.render_into(cx, out).await;
            cx.restore(saved);
            // Loop control must not leak out of an isolated child
            result.map(|control| match control {
                Control::Terminate => Control::Terminate,
                _ => Control::Normal,
            })
        } else {
            cx.enter_scope();
            for (key, value) in parameters {
                cx.set_variable(key, value);
            }
            let result = template.render_into(cx, out).await;
            cx.exit_scope();
            result
        }
    }
}

fn parse_include(
    tag: &mut TagParser<'_>,
) -> Result<Statement, TemplateParseError> {
    let (name, parameters) = parse_partial_reference(tag)?;
    Ok(Statement::Include(IncludeStatement { name, parameters }))
}

fn parse_render(
    tag: &mut TagParser<'_>,
) -> Result<Statement, TemplateParseError> {
    let (name, parameters) = parse_partial_reference(tag)?;
    Ok(Statement::RenderPartial(IncludeStatement { name, parameters }))
}

/// Shared grammar: a template name expression, then optional `key: value`
/// parameters (a separating comma after the name is optional)
fn parse_partial_reference(
    tag: &mut TagParser<'_>,
) -> Result<(Expression, IndexMap<Identifier, Expression>), TemplateParseError>
{
    let name = tag.expect_value()?;
    tag.accept_char(',');
    let parameters = tag.keyword_arguments()?;
    Ok((name, parameters))
}

/// `{% raw %}`: the scanner captured the interior verbatim as a single text
/// run; pass it through as-is
fn parse_raw(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    tag.finish()?;
    let (body, _) = block.parse_until(&["endraw"])?;
    Ok(body
        .into_iter()
        .next()
        .unwrap_or(Statement::Text("".into())))
}

/// `{% comment %}`: the interior is discarded entirely
fn parse_comment(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    tag.finish()?;
    let _ = block.parse_until(&["endcomment"])?;
    Ok(Statement::Text("".into()))
}
