//! Variable tags: `assign`, `capture`, `echo`, `increment`, `decrement`

use crate::{
    ast::{Control, OutputStatement, Statement},
    context::RenderContext,
    error::{RenderError, TemplateParseError},
    expression::{Expression, Identifier},
    parse::{BlockParser, Parser, TagParser},
    render::{Output, render_statements},
    value::Value,
};

pub(crate) fn register(parser: &mut Parser) {
    parser.register_tag("assign", parse_assign);
    parser.register_tag("echo", parse_echo);
    parser.register_block("capture", parse_capture);
    parser.register_identifier_tag("increment", Statement::Increment);
    parser.register_identifier_tag("decrement", Statement::Decrement);
}

/// `{% assign x = expr %}`: bind a variable in the innermost scope
#[derive(Debug)]
pub struct AssignStatement {
    pub(crate) name: Identifier,
    pub(crate) value: Expression,
}

impl AssignStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
    ) -> Result<Control, RenderError> {
        let value = self.value.evaluate(cx).await?;
        cx.set_variable(self.name.as_str(), value);
        Ok(Control::Normal)
    }
}

fn parse_assign(
    tag: &mut TagParser<'_>,
) -> Result<Statement, TemplateParseError> {
    let name = tag.expect_identifier()?;
    tag.expect_char('=')?;
    let value = tag.expect_expression()?;
    Ok(Statement::Assign(AssignStatement { name, value }))
}

/// `{% echo expr %}`: identical to `{{ expr }}`, for tag-only contexts
fn parse_echo(
    tag: &mut TagParser<'_>,
) -> Result<Statement, TemplateParseError> {
    let expression = tag.expect_expression()?;
    Ok(Statement::Output(OutputStatement { expression }))
}

/// `{% capture x %}...{% endcapture %}`: render the body into a side buffer
/// and bind it. The buffer is encoded as it's written, so the binding is
/// markup and re-emitting it won't double-encode.
#[derive(Debug)]
pub struct CaptureStatement {
    pub(crate) name: Identifier,
    pub(crate) body: Vec<Statement>,
}

impl CaptureStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        _out: &mut Output,
    ) -> Result<Control, RenderError> {
        let mut buffer = Output::new(cx.output_limit());
        let control = render_statements(&self.body, cx, &mut buffer).await?;
        cx.set_variable(
            self.name.as_str(),
            Value::Markup(buffer.into_string()),
        );
        // Loop control inside the capture still applies to the enclosing
        // loop; the partial capture is bound either way
        Ok(control)
    }
}

fn parse_capture(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    let name = tag.expect_identifier()?;
    let (body, _) = block.parse_until(&["endcapture"])?;
    Ok(Statement::Capture(CaptureStatement { name, body }))
}
