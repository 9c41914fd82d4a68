//! Conditional blocks: `if`/`elsif`/`else`, `unless`, and `case`/`when`

use crate::{
    ast::{Control, Statement},
    context::RenderContext,
    error::{RenderError, TemplateParseError},
    expression::Expression,
    parse::{BlockParser, Parser, TagParser},
    render::{Output, render_statements},
};

pub(crate) fn register(parser: &mut Parser) {
    parser.register_block("if", parse_if);
    parser.register_block("unless", parse_unless);
    parser.register_block("case", parse_case);
}

/// One guarded arm of an `if`/`unless` chain
#[derive(Debug)]
pub struct IfBranch {
    pub(crate) condition: Expression,
    /// Inverted guard, for `unless`
    pub(crate) negate: bool,
    pub(crate) body: Vec<Statement>,
}

/// `{% if %}`/`{% elsif %}`/`{% else %}` (and `unless` as its inverted
/// sibling). Guards evaluate in order; the first match renders.
#[derive(Debug)]
pub struct IfStatement {
    pub(crate) branches: Vec<IfBranch>,
    pub(crate) else_body: Option<Vec<Statement>>,
}

impl IfStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        for branch in &self.branches {
            let truthy = branch.condition.evaluate(cx).await?.to_bool();
            if truthy != branch.negate {
                return render_statements(&branch.body, cx, out).await;
            }
        }
        if let Some(body) = &self.else_body {
            return render_statements(body, cx, out).await;
        }
        Ok(Control::Normal)
    }
}

fn parse_if(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    let condition = tag.expect_condition()?;
    parse_conditional(condition, false, "endif", block)
}

fn parse_unless(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    let condition = tag.expect_condition()?;
    parse_conditional(condition, true, "endunless", block)
}

/// Shared grammar for `if` and `unless`: a chain of `elsif` arms and at most
/// one trailing `else`
fn parse_conditional(
    first: Expression,
    negate_first: bool,
    end: &'static str,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    let mut branches: Vec<IfBranch> = Vec::new();
    let mut else_body: Option<Vec<Statement>> = None;
    // The guard for the body we're about to parse; `None` once we've passed
    // `else`
    let mut condition = Some((first, negate_first));

    loop {
        let (body, stop) = block.parse_until(&["elsif", "else", end])?;
        match condition.take() {
            Some((guard, negate)) => branches.push(IfBranch {
                condition: guard,
                negate,
                body,
            }),
            None => else_body = Some(body),
        }

        let (name, mut args) = stop.into_parts();
        match name.as_str() {
            "elsif" => {
                if else_body.is_some() {
                    return Err(
                        args.error("`elsif` cannot follow `else`")
                    );
                }
                let guard = args.expect_condition()?;
                args.finish()?;
                condition = Some((guard, false));
            }
            "else" => {
                if else_body.is_some() {
                    return Err(args.error("duplicate `else`"));
                }
                args.finish()?;
            }
            _ => {
                return Ok(Statement::If(IfStatement {
                    branches,
                    else_body,
                }));
            }
        }
    }
}

/// One `{% when %}` clause, possibly with several candidate values
#[derive(Debug)]
pub struct WhenClause {
    pub(crate) values: Vec<Expression>,
    pub(crate) body: Vec<Statement>,
}

/// `{% case %}`/`{% when %}`/`{% else %}`: compare a subject against each
/// clause's values; the first equal clause renders
#[derive(Debug)]
pub struct CaseStatement {
    pub(crate) subject: Expression,
    pub(crate) clauses: Vec<WhenClause>,
    pub(crate) else_body: Option<Vec<Statement>>,
}

impl CaseStatement {
    pub(crate) async fn render(
        &self,
        cx: &mut RenderContext,
        out: &mut Output,
    ) -> Result<Control, RenderError> {
        let subject = self.subject.evaluate(cx).await?;
        for clause in &self.clauses {
            for value in &clause.values {
                if value.evaluate(cx).await?.equals(&subject) {
                    return render_statements(&clause.body, cx, out).await;
                }
            }
        }
        if let Some(body) = &self.else_body {
            return render_statements(body, cx, out).await;
        }
        Ok(Control::Normal)
    }
}

fn parse_case(
    tag: &mut TagParser<'_>,
    block: &mut BlockParser<'_, '_>,
) -> Result<Statement, TemplateParseError> {
    const STOPS: &[&str] = &["when", "else", "endcase"];

    let subject = tag.expect_expression()?;
    let mut clauses: Vec<WhenClause> = Vec::new();
    let mut else_body: Option<Vec<Statement>> = None;

    // Anything between `case` and the first `when` is discarded
    let (_, mut stop) = block.parse_until(STOPS)?;
    loop {
        let (name, mut args) = stop.into_parts();
        match name.as_str() {
            "when" => {
                let values = parse_when_values(&mut args)?;
                let (body, next) = block.parse_until(STOPS)?;
                clauses.push(WhenClause { values, body });
                stop = next;
            }
            "else" => {
                args.finish()?;
                let (body, next) = block.parse_until(STOPS)?;
                if else_body.replace(body).is_some() {
                    return Err(args.error("duplicate `else`"));
                }
                stop = next;
            }
            _ => {
                return Ok(Statement::Case(CaseStatement {
                    subject,
                    clauses,
                    else_body,
                }));
            }
        }
    }
}

/// `when` accepts several values separated by `,` or `or`
fn parse_when_values(
    args: &mut TagParser<'_>,
) -> Result<Vec<Expression>, TemplateParseError> {
    let mut values = vec![args.expect_value()?];
    while args.accept_char(',') || args.accept_keyword("or") {
        values.push(args.expect_value()?);
    }
    args.finish()?;
    Ok(values)
}
