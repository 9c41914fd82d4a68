//! Template parsing
//!
//! Parsing runs in two stages. A hand-written scanner splits the source into
//! text, output (`{{ }}`), and tag (`{% %}`) tokens, handling whitespace
//! trimming dashes and capturing raw/comment interiors verbatim. A recursive
//! descent pass then walks the token stream, dispatching tags through the
//! grammar table and parsing expression interiors with winnow combinators.

use crate::{
    ast::{OutputStatement, Statement, Template},
    error::TemplateParseError,
    expression::{
        BinaryOperator, Expression, FilterCall, FunctionCall, Identifier,
        Literal,
    },
    tags,
};
use indexmap::IndexMap;
use itertools::Itertools;
use rust_decimal::Decimal;
use std::{collections::VecDeque, sync::Arc};
use tracing::debug;
use winnow::{
    ModalParser, ModalResult, Parser as _,
    ascii::{digit1, multispace0},
    combinator::{
        alt, cut_err, delimited, fail, not, opt, preceded, repeat, separated,
        separated_pair, terminated,
    },
    error::{ContextError, StrContext, StrContextValue},
    token::{one_of, take_till, take_while},
};

/// Marks the start of an output expression
const OUTPUT_OPEN: &str = "{{";
/// Marks the end of an output expression
const OUTPUT_CLOSE: &str = "}}";
/// Marks the start of a tag
const TAG_OPEN: &str = "{%";
/// Marks the end of a tag
const TAG_CLOSE: &str = "%}";
/// Decorates a delimiter to request whitespace stripping
const TRIM: char = '-';

/// The statement/tag parser. Tags and blocks are registered into the grammar
/// table; a configured parser is an immutable factory for templates and can
/// be shared freely.
pub struct Parser {
    tags: IndexMap<String, TagSyntax>,
    pub(crate) config: ParserConfig,
}

/// Scanner-level options
#[derive(Clone, Debug)]
pub(crate) struct ParserConfig {
    /// Permit tag arguments to span newlines
    pub greedy: bool,
    /// Strip whitespace around every tag, as if `{%- -%}` were written
    pub trim_tags: bool,
    /// Strip whitespace around every output expression, as if `{{- -}}`
    /// were written
    pub trim_blocks: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            greedy: true,
            trim_tags: false,
            trim_blocks: false,
        }
    }
}

/// How a registered tag is parsed
enum TagSyntax {
    /// A leaf tag: arguments only, no body
    Leaf(LeafParseFn),
    /// A block: the callback consumes the body (and any intermediate
    /// sub-tags) from the stream up to and including its terminator
    Block(BlockParseFn),
}

type LeafParseFn = Arc<
    dyn Fn(&mut TagParser<'_>) -> Result<Statement, TemplateParseError>
        + Send
        + Sync,
>;
type BlockParseFn = Arc<
    dyn Fn(
            &mut TagParser<'_>,
            &mut BlockParser<'_, '_>,
        ) -> Result<Statement, TemplateParseError>
        + Send
        + Sync,
>;

impl Parser {
    /// Create a parser with the full built-in tag set registered
    pub fn new() -> Self {
        let mut parser = Self {
            tags: IndexMap::new(),
            config: ParserConfig::default(),
        };
        tags::register_builtins(&mut parser);
        parser
    }

    /// Permit tag arguments to span newlines (default true)
    pub fn greedy(&mut self, greedy: bool) -> &mut Self {
        self.config.greedy = greedy;
        self
    }

    /// Strip whitespace around every tag by default
    pub fn trim_tags(&mut self, trim: bool) -> &mut Self {
        self.config.trim_tags = trim;
        self
    }

    /// Strip whitespace around every output expression by default
    pub fn trim_blocks(&mut self, trim: bool) -> &mut Self {
        self.config.trim_blocks = trim;
        self
    }

    /// Register a tag of the form `{% name args %}`. The callback parses the
    /// arguments; trailing unparsed content is an error.
    pub fn register_tag<F>(&mut self, name: impl Into<String>, parse: F)
    where
        F: Fn(&mut TagParser<'_>) -> Result<Statement, TemplateParseError>
            + Send
            + Sync
            + 'static,
    {
        self.tags
            .insert(name.into(), TagSyntax::Leaf(Arc::new(parse)));
    }

    /// Register a tag of the form `{% name identifier %}`
    pub fn register_identifier_tag<F>(
        &mut self,
        name: impl Into<String>,
        build: F,
    ) where
        F: Fn(Identifier) -> Statement + Send + Sync + 'static,
    {
        self.register_tag(name, move |tag| {
            let identifier = tag.expect_identifier()?;
            Ok(build(identifier))
        });
    }

    /// Register a tag of the form `{% name %}`, taking no arguments
    pub fn register_empty_tag<F>(&mut self, name: impl Into<String>, build: F)
    where
        F: Fn() -> Statement + Send + Sync + 'static,
    {
        self.register_tag(name, move |_| Ok(build()));
    }

    /// Register a block: an opening tag plus a body that runs to a
    /// terminating `{% endname %}`, possibly with intermediate sub-tags. The
    /// callback must consume the body from the [BlockParser], including the
    /// terminator.
    pub fn register_block<F>(&mut self, name: impl Into<String>, parse: F)
    where
        F: Fn(
                &mut TagParser<'_>,
                &mut BlockParser<'_, '_>,
            ) -> Result<Statement, TemplateParseError>
            + Send
            + Sync
            + 'static,
    {
        self.tags
            .insert(name.into(), TagSyntax::Block(Arc::new(parse)));
    }

    /// Parse a template. The returned template is immutable and can be
    /// rendered any number of times, concurrently.
    pub fn parse(
        &self,
        source: &str,
    ) -> Result<Template, TemplateParseError> {
        debug!(len = source.len(), "parsing template");
        let tokens = tokenize(source, &self.config)?;
        let mut stream = TokenStream::new(tokens, source.len());
        let (statements, _) = parse_statements(&mut stream, self, None)?;
        Ok(Template::new(statements))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

// === Scanner ===

/// A lexical token, after whitespace trimming has been applied
#[derive(Copy, Clone, Debug)]
enum Token<'src> {
    /// Literal text outside any delimiter
    Text(&'src str),
    /// The interior of a `{{ }}`
    Output { source: &'src str, offset: usize },
    /// The interior of a `{% %}`, split into tag name and arguments
    Tag {
        name: &'src str,
        args: &'src str,
        name_offset: usize,
        args_offset: usize,
    },
}

/// A scanned token plus its trimming decorations, before trimming is applied
#[derive(Copy, Clone)]
struct RawToken<'src> {
    token: Token<'src>,
    trim_before: bool,
    trim_after: bool,
}

impl RawToken<'_> {
    fn text(text: &str) -> RawToken<'_> {
        RawToken {
            token: Token::Text(text),
            trim_before: false,
            trim_after: false,
        }
    }

    /// Does this token strip whitespace from the preceding text run?
    fn trims_before(&self, config: &ParserConfig) -> bool {
        self.trim_before || self.trims_by_default(config)
    }

    /// Does this token strip whitespace from the following text run?
    fn trims_after(&self, config: &ParserConfig) -> bool {
        self.trim_after || self.trims_by_default(config)
    }

    fn trims_by_default(&self, config: &ParserConfig) -> bool {
        match self.token {
            Token::Text(_) => false,
            Token::Output { .. } => config.trim_blocks,
            Token::Tag { .. } => config.trim_tags,
        }
    }
}

/// Split the source into raw tokens, then apply whitespace stripping.
/// Stripping happens here, during construction, so the statement parser and
/// the renderer never see it.
fn tokenize<'src>(
    source: &'src str,
    config: &ParserConfig,
) -> Result<Vec<Token<'src>>, TemplateParseError> {
    let mut raw: Vec<RawToken<'src>> = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        // Accumulate literal text up to the next delimiter
        let Some(open) = find_delimiter(rest) else {
            raw.push(RawToken::text(rest));
            break;
        };
        if open > 0 {
            raw.push(RawToken::text(&rest[..open]));
            pos += open;
        }

        let (token, next) = scan_delimited(source, pos, config)?;
        pos = next;

        // Raw and comment interiors are captured in the scanner so their
        // contents are never tokenized
        if let Token::Tag { name, name_offset, .. } = token.token
            && (name == "raw" || name == "comment")
        {
            let end_name = if name == "raw" { "endraw" } else { "endcomment" };
            let (interior, end_token, next) =
                scan_verbatim(source, pos, name, end_name, name_offset)?;
            raw.push(token);
            raw.push(RawToken::text(interior));
            raw.push(end_token);
            pos = next;
        } else {
            raw.push(token);
        }
    }

    Ok(apply_trimming(raw, config))
}

/// Find the byte offset of the next `{{` or `{%`, if any
fn find_delimiter(rest: &str) -> Option<usize> {
    match (rest.find(OUTPUT_OPEN), rest.find(TAG_OPEN)) {
        (Some(output), Some(tag)) => Some(output.min(tag)),
        (Some(output), None) => Some(output),
        (None, Some(tag)) => Some(tag),
        (None, None) => None,
    }
}

/// Scan one delimited token starting at `start` (which points at `{{` or
/// `{%`). Returns the token and the position just past its close delimiter.
fn scan_delimited<'src>(
    source: &'src str,
    start: usize,
    config: &ParserConfig,
) -> Result<(RawToken<'src>, usize), TemplateParseError> {
    let is_tag = source[start..].starts_with(TAG_OPEN);
    let close = if is_tag { TAG_CLOSE } else { OUTPUT_CLOSE };

    let mut content_start = start + 2;
    let trim_before = source[content_start..].starts_with(TRIM);
    if trim_before {
        content_start += 1;
    }

    // Find the close delimiter, skipping over quoted strings
    let interior = &source[content_start..];
    let mut quote: Option<char> = None;
    let mut close_at = None;
    for (i, c) in interior.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if interior[i..].starts_with(close) => {
                close_at = Some(i);
                break;
            }
            None => {}
        }
    }
    let Some(close_at) = close_at else {
        return Err(TemplateParseError::new(
            start,
            format!("unterminated `{}`", if is_tag { TAG_OPEN } else { OUTPUT_OPEN }),
        ));
    };

    let mut content = &interior[..close_at];
    let trim_after = content.ends_with(TRIM);
    if trim_after {
        content = &content[..content.len() - TRIM.len_utf8()];
    }
    let next = content_start + close_at + close.len();

    if is_tag && !config.greedy && content.contains('\n') {
        return Err(TemplateParseError::new(
            start,
            "tag arguments may not span newlines",
        ));
    }

    let token = if is_tag {
        let trimmed = content.trim_start();
        let name_offset = content_start + (content.len() - trimmed.len());
        let name_len = trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        let (name, args) = trimmed.split_at(name_len);
        if name.is_empty() {
            return Err(TemplateParseError::new(
                name_offset,
                "expected tag name",
            ));
        }
        Token::Tag {
            name,
            args,
            name_offset,
            args_offset: name_offset + name_len,
        }
    } else {
        Token::Output {
            source: content,
            offset: content_start,
        }
    };

    Ok((
        RawToken {
            token,
            trim_before,
            trim_after,
        },
        next,
    ))
}

/// Capture everything from `pos` up to the matching `{% endname %}` without
/// tokenizing it. Returns the verbatim interior, the end tag's token, and the
/// position just past it.
fn scan_verbatim<'src>(
    source: &'src str,
    pos: usize,
    name: &str,
    end_name: &str,
    open_offset: usize,
) -> Result<(&'src str, RawToken<'src>, usize), TemplateParseError> {
    let mut search = pos;
    while let Some(found) = source[search..].find(TAG_OPEN) {
        let candidate = search + found;
        if let Some((end_token, next)) = match_end_tag(source, candidate, end_name)
        {
            return Ok((&source[pos..candidate], end_token, next));
        }
        search = candidate + TAG_OPEN.len();
    }
    Err(TemplateParseError::new(
        open_offset,
        format!("unclosed `{name}` block; expected `{{% {end_name} %}}`"),
    ))
}

/// Check whether the `{%` at `start` is exactly `{%[-] end_name [-]%}`
fn match_end_tag<'src>(
    source: &'src str,
    start: usize,
    end_name: &str,
) -> Option<(RawToken<'src>, usize)> {
    let mut rest = &source[start + TAG_OPEN.len()..];
    let trim_before = rest.starts_with(TRIM);
    if trim_before {
        rest = &rest[TRIM.len_utf8()..];
    }
    rest = rest.trim_start();
    rest = rest.strip_prefix(end_name)?;
    let name_offset = source.len() - rest.len() - end_name.len();
    rest = rest.trim_start();
    let trim_after = rest.starts_with(TRIM);
    if trim_after {
        rest = &rest[TRIM.len_utf8()..];
    }
    rest = rest.strip_prefix(TAG_CLOSE)?;
    let next = source.len() - rest.len();
    Some((
        RawToken {
            token: Token::Tag {
                name: &source[name_offset..name_offset + end_name.len()],
                args: "",
                name_offset,
                args_offset: name_offset + end_name.len(),
            },
            trim_before,
            trim_after,
        },
        next,
    ))
}

/// Apply whitespace stripping to text runs based on their neighbors'
/// trimming decorations and the configured defaults. Emptied text runs are
/// dropped.
fn apply_trimming<'src>(
    raw: Vec<RawToken<'src>>,
    config: &ParserConfig,
) -> Vec<Token<'src>> {
    let mut tokens = Vec::with_capacity(raw.len());
    for i in 0..raw.len() {
        match raw[i].token {
            Token::Text(text) => {
                let mut slice = text;
                if raw
                    .get(i + 1)
                    .is_some_and(|next| next.trims_before(config))
                {
                    slice = slice.trim_end();
                }
                if i > 0 && raw[i - 1].trims_after(config) {
                    slice = slice.trim_start();
                }
                if !slice.is_empty() {
                    tokens.push(Token::Text(slice));
                }
            }
            token => tokens.push(token),
        }
    }
    tokens
}

// === Statement parsing ===

/// The scanned token sequence consumed by recursive descent
struct TokenStream<'src> {
    tokens: VecDeque<Token<'src>>,
    /// Source length, for end-of-input error offsets
    end_offset: usize,
}

impl<'src> TokenStream<'src> {
    fn new(tokens: Vec<Token<'src>>, end_offset: usize) -> Self {
        Self {
            tokens: tokens.into(),
            end_offset,
        }
    }

    fn next(&mut self) -> Option<Token<'src>> {
        self.tokens.pop_front()
    }
}

/// The terminating or intermediate sub-tag that ended a block body, e.g. the
/// `{% elsif cond %}` or `{% endif %}` that stopped an `if` body
pub struct BlockTag<'src> {
    name: String,
    args: TagParser<'src>,
}

impl<'src> BlockTag<'src> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Argument parser for the sub-tag, e.g. the condition of an `elsif`
    pub fn into_args(self) -> TagParser<'src> {
        self.args
    }

    /// Split into the tag name and its argument parser
    pub fn into_parts(self) -> (String, TagParser<'src>) {
        (self.name, self.args)
    }
}

/// Handed to block grammar callbacks to consume their body from the token
/// stream
pub struct BlockParser<'s, 'src> {
    stream: &'s mut TokenStream<'src>,
    parser: &'s Parser,
}

impl<'src> BlockParser<'_, 'src> {
    /// Parse statements until one of the named stop tags appears at this
    /// nesting level. The stop tag is consumed and returned. Hitting the end
    /// of the template first is an error.
    pub fn parse_until(
        &mut self,
        stops: &[&str],
    ) -> Result<(Vec<Statement>, BlockTag<'src>), TemplateParseError> {
        let (statements, stop) =
            parse_statements(self.stream, self.parser, Some(stops))?;
        // parse_statements only returns None for a stop when parsing without
        // one, which can't happen here
        let stop = stop.expect("block parse must end on a stop tag");
        Ok((statements, stop))
    }
}

/// Walk the token stream front to back, building statements. With `stops`,
/// stop (and return the stop tag) when one of those tag names appears;
/// without, run to the end of input.
fn parse_statements<'src>(
    stream: &mut TokenStream<'src>,
    parser: &Parser,
    stops: Option<&[&str]>,
) -> Result<(Vec<Statement>, Option<BlockTag<'src>>), TemplateParseError> {
    let mut statements = Vec::new();
    while let Some(token) = stream.next() {
        match token {
            Token::Text(text) => {
                statements.push(Statement::Text(text.into()));
            }
            Token::Output { source, offset } => {
                let expression = parse_expression_source(source, offset)?;
                statements
                    .push(Statement::Output(OutputStatement { expression }));
            }
            Token::Tag {
                name,
                args,
                name_offset,
                args_offset,
            } => {
                if let Some(stops) = stops
                    && stops.contains(&name)
                {
                    return Ok((
                        statements,
                        Some(BlockTag {
                            name: name.to_owned(),
                            args: TagParser::new(args, args_offset),
                        }),
                    ));
                }
                let statement = match parser.tags.get(name) {
                    Some(TagSyntax::Leaf(parse)) => {
                        let mut tag = TagParser::new(args, args_offset);
                        let statement = parse(&mut tag)?;
                        tag.finish()?;
                        statement
                    }
                    Some(TagSyntax::Block(parse)) => {
                        let mut tag = TagParser::new(args, args_offset);
                        let mut block = BlockParser { stream, parser };
                        let statement = parse(&mut tag, &mut block)?;
                        tag.finish()?;
                        statement
                    }
                    None if name.starts_with("end") => {
                        return Err(TemplateParseError::new(
                            name_offset,
                            format!("unexpected `{{% {name} %}}`"),
                        ));
                    }
                    None => {
                        return Err(TemplateParseError::new(
                            name_offset,
                            format!("unknown tag `{name}`"),
                        ));
                    }
                };
                statements.push(statement);
            }
        }
    }

    if let Some(stops) = stops {
        Err(TemplateParseError::new(
            stream.end_offset,
            format!(
                "unexpected end of template; expected {}",
                stops
                    .iter()
                    .map(|stop| format!("`{{% {stop} %}}`"))
                    .join(" or ")
            ),
        ))
    } else {
        Ok((statements, None))
    }
}

// === Tag argument parsing ===

/// Incremental parser over one tag's argument source, handed to tag grammar
/// callbacks. Wraps the winnow expression grammar with positioned errors.
pub struct TagParser<'src> {
    source: &'src str,
    rest: &'src str,
    /// Byte offset of `source` within the full template
    offset: usize,
}

impl<'src> TagParser<'src> {
    pub(crate) fn new(source: &'src str, offset: usize) -> Self {
        Self {
            source,
            rest: source,
            offset,
        }
    }

    /// Template offset of the current parse position
    fn position(&self) -> usize {
        self.offset + (self.source.len() - self.rest.len())
    }

    /// Attempt a parser, restoring the input on failure
    fn attempt<O>(
        &mut self,
        mut parser: impl ModalParser<&'src str, O, ContextError>,
    ) -> Option<O> {
        let saved = self.rest;
        match parser.parse_next(&mut self.rest) {
            Ok(value) => Some(value),
            Err(_) => {
                self.rest = saved;
                None
            }
        }
    }

    /// Run a parser, producing a positioned error on failure
    fn expect<O>(
        &mut self,
        parser: impl ModalParser<&'src str, O, ContextError>,
        expected: &str,
    ) -> Result<O, TemplateParseError> {
        self.attempt(parser).ok_or_else(|| {
            TemplateParseError::new(
                self.position(),
                format!("expected {expected}"),
            )
        })
    }

    /// Parse an identifier
    pub fn expect_identifier(
        &mut self,
    ) -> Result<Identifier, TemplateParseError> {
        self.expect(ws(identifier), "identifier")
    }

    /// Parse a full expression, including any filter chain
    pub fn expect_expression(
        &mut self,
    ) -> Result<Expression, TemplateParseError> {
        self.expect(ws(filtered_expression), "expression")
    }

    /// Parse a condition: comparisons and `and`/`or` chains, no filters
    pub fn expect_condition(
        &mut self,
    ) -> Result<Expression, TemplateParseError> {
        self.expect(ws(logical_expression), "condition")
    }

    /// Parse a single value: a literal, variable, range, or access chain,
    /// stopping short of operators and filters. This is what `when` values
    /// and `cycle` items use, where `or` and `,` are list separators.
    pub fn expect_value(&mut self) -> Result<Expression, TemplateParseError> {
        self.expect(ws(member_expression), "value")
    }

    /// Require a bare keyword such as `in`
    pub fn expect_keyword(
        &mut self,
        keyword: &'static str,
    ) -> Result<(), TemplateParseError> {
        self.expect(ws(word(keyword)), keyword).map(|_| ())
    }

    /// Consume a bare keyword if present
    pub fn accept_keyword(&mut self, keyword: &'static str) -> bool {
        self.attempt(ws(word(keyword))).is_some()
    }

    /// Require a punctuation character such as `:` or `=`
    pub fn expect_char(&mut self, c: char) -> Result<(), TemplateParseError> {
        self.expect(ws(c), &c.to_string()).map(|_| ())
    }

    /// Consume a punctuation character if present
    pub fn accept_char(&mut self, c: char) -> bool {
        self.attempt(ws(c)).is_some()
    }

    /// Parse `name: expr` keyword arguments to the end of the tag, in the
    /// style of `include`/`render` parameters. Separating commas are
    /// optional. Repeated names keep the last value.
    pub fn keyword_arguments(
        &mut self,
    ) -> Result<IndexMap<Identifier, Expression>, TemplateParseError> {
        let mut keyword = IndexMap::new();
        while !self.at_end() {
            let name = self.expect_identifier()?;
            self.expect_char(':')?;
            let value = self.expect_expression()?;
            keyword.insert(name, value);
            self.accept_char(',');
        }
        Ok(keyword)
    }

    /// Is there anything left but whitespace?
    pub fn at_end(&mut self) -> bool {
        self.rest.trim_start().is_empty()
    }

    /// The full argument source of this tag
    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Build a parse error at the current position, for tag grammars with
    /// their own validation
    pub fn error(&self, message: impl Into<String>) -> TemplateParseError {
        TemplateParseError::new(self.position(), message.into())
    }

    /// Require that all arguments have been consumed
    pub fn finish(&mut self) -> Result<(), TemplateParseError> {
        if self.at_end() {
            Ok(())
        } else {
            let trailing = self.rest.trim();
            Err(TemplateParseError::new(
                self.position(),
                format!("unexpected trailing content `{trailing}`"),
            ))
        }
    }
}

/// Parse the full interior of an `{{ }}` output chunk
fn parse_expression_source(
    source: &str,
    base: usize,
) -> Result<Expression, TemplateParseError> {
    ws(filtered_expression)
        .parse(source)
        .map_err(|error| TemplateParseError::from_winnow(&error, base))
}

// === Expression grammar (winnow) ===

/// Parse an expression with its trailing filter chain. Filters are
/// left-associative: `a | f | g` applies `f` first.
fn filtered_expression(input: &mut &str) -> ModalResult<Expression> {
    let first = logical_expression.parse_next(input)?;
    let filters: Vec<FilterCall> =
        repeat(0.., filter_call).parse_next(input)?;
    Ok(filters.into_iter().fold(first, |acc, call| {
        Expression::Filter {
            input: Box::new(acc),
            call,
        }
    }))
}

/// Parse comparisons chained with `and`/`or`. The two operators have no
/// mutual precedence and associate right-to-left, per Liquid: `a and b or c`
/// is `a and (b or c)`.
fn logical_expression(input: &mut &str) -> ModalResult<Expression> {
    let first = comparison.parse_next(input)?;
    let mut rest: Vec<(BinaryOperator, Expression)> =
        repeat(0.., (ws(logical_operator), comparison)).parse_next(input)?;

    let Some((mut acc_operator, mut acc)) = rest.pop() else {
        return Ok(first);
    };
    while let Some((operator, expression)) = rest.pop() {
        acc = Expression::Binary {
            operator: acc_operator,
            lhs: Box::new(expression),
            rhs: Box::new(acc),
        };
        acc_operator = operator;
    }
    Ok(Expression::Binary {
        operator: acc_operator,
        lhs: Box::new(first),
        rhs: Box::new(acc),
    })
}

/// Parse member expressions chained with comparison operators,
/// left-associatively
fn comparison(input: &mut &str) -> ModalResult<Expression> {
    let first = member_expression.parse_next(input)?;
    let rest: Vec<(BinaryOperator, Expression)> =
        repeat(0.., (ws(comparison_operator), member_expression))
            .parse_next(input)?;
    Ok(rest.into_iter().fold(first, |acc, (operator, expression)| {
        Expression::Binary {
            operator,
            lhs: Box::new(acc),
            rhs: Box::new(expression),
        }
    }))
}

fn logical_operator(input: &mut &str) -> ModalResult<BinaryOperator> {
    alt((
        word("and").value(BinaryOperator::And),
        word("or").value(BinaryOperator::Or),
    ))
    .parse_next(input)
}

fn comparison_operator(input: &mut &str) -> ModalResult<BinaryOperator> {
    alt((
        "==".value(BinaryOperator::Equal),
        "!=".value(BinaryOperator::NotEqual),
        "<>".value(BinaryOperator::NotEqual),
        "<=".value(BinaryOperator::LessEqual),
        ">=".value(BinaryOperator::GreaterEqual),
        "<".value(BinaryOperator::Less),
        ">".value(BinaryOperator::Greater),
        word("contains").value(BinaryOperator::Contains),
    ))
    .parse_next(input)
}

/// Parse a primary expression with its trailing member/index segments:
/// `a.b[0].c`. Chains without bound.
fn member_expression(input: &mut &str) -> ModalResult<Expression> {
    enum Segment {
        Member(Identifier),
        Index(Expression),
    }

    let first = primary_expression.parse_next(input)?;
    let segments: Vec<Segment> = repeat(
        0..,
        alt((
            // `.` must not swallow the `..` of a range. Once we know it's a
            // member dot, a missing identifier is fatal
            preceded(('.', not('.')), cut_err(identifier))
                .map(Segment::Member)
                .context(ctx_label("member access")),
            delimited(
                '[',
                cut_err(ws(logical_expression)),
                cut_err(']'.context(StrContext::Expected(
                    StrContextValue::CharLiteral(']'),
                ))),
            )
            .map(Segment::Index)
            .context(ctx_label("index access")),
        )),
    )
    .parse_next(input)?;

    Ok(segments.into_iter().fold(first, |acc, segment| match segment {
        Segment::Member(name) => Expression::Member {
            object: Box::new(acc),
            name,
        },
        Segment::Index(index) => Expression::Index {
            object: Box::new(acc),
            index: Box::new(index),
        },
    }))
}

/// Parse an initial inner expression: a literal, a parenthesized range, a
/// function call, or an identifier
fn primary_expression(input: &mut &str) -> ModalResult<Expression> {
    ws(alt((
        number_literal.map(Expression::Literal),
        string_literal.map(Expression::Literal),
        range_expression,
        word_expression,
        fail.context(ctx_label("expression"))
            .context(ctx_expected("literal"))
            .context(ctx_expected("range"))
            .context(ctx_expected("variable")),
    )))
    .parse_next(input)
}

/// Parse a decimal number literal. The scale is preserved exactly as
/// written: `1.0` and `1` are equal but render differently.
fn number_literal(input: &mut &str) -> ModalResult<Literal> {
    (opt('-'), digit1, opt(('.', digit1)))
        .take()
        .try_map(str::parse::<Decimal>)
        .map(Literal::Number)
        .context(ctx_label("number"))
        .parse_next(input)
}

/// Parse a string literal: '...' or "...". Faithful to Liquid, there are no
/// escape sequences.
fn string_literal(input: &mut &str) -> ModalResult<Literal> {
    fn quoted<'a>(
        quote: char,
    ) -> impl ModalParser<&'a str, &'a str, ContextError> {
        // The opening quote is unambiguous, so a missing close is fatal
        preceded(
            quote,
            cut_err(terminated(
                take_till(0.., move |c| c == quote),
                quote.context(StrContext::Expected(
                    StrContextValue::CharLiteral(quote),
                )),
            )),
        )
    }

    alt((quoted('\''), quoted('"')))
        .map(|s: &str| Literal::String(s.to_owned()))
        .context(ctx_label("string literal"))
        .parse_next(input)
}

/// Parse a parenthesized range: `(start..end)`. Bounds can be any member
/// expression.
fn range_expression(input: &mut &str) -> ModalResult<Expression> {
    preceded(
        '(',
        cut_err(terminated(
            separated_pair(
                ws(member_expression),
                "..",
                ws(member_expression),
            ),
            ')'.context(StrContext::Expected(StrContextValue::CharLiteral(
                ')',
            ))),
        )),
    )
    .map(|(start, end)| Expression::Range {
        start: Box::new(start),
        end: Box::new(end),
    })
    .context(ctx_label("range"))
    .parse_next(input)
}

/// Parse an expression starting with an identifier: a keyword literal
/// (`nil`, `true`, `empty`, ...), a function call, or a plain variable
fn word_expression(input: &mut &str) -> ModalResult<Expression> {
    let id = identifier.parse_next(input)?;
    let expression = match id.as_str() {
        "nil" | "null" => Expression::Literal(Literal::Nil),
        "true" => Expression::Literal(Literal::Boolean(true)),
        "false" => Expression::Literal(Literal::Boolean(false)),
        "empty" => Expression::Literal(Literal::Empty),
        "blank" => Expression::Literal(Literal::Blank),
        _ if input.starts_with('(') => {
            let (position, keyword) = call_arguments.parse_next(input)?;
            Expression::Call(FunctionCall {
                target: id,
                position,
                keyword,
            })
        }
        _ => Expression::Identifier(id),
    };
    Ok(expression)
}

/// A positional or keyword argument, before placement validation
enum Argument {
    Position(Expression),
    Keyword(Identifier, Expression),
}

/// Parse a single positional or keyword argument. Named arguments accept
/// either `:` or `=`.
fn argument(input: &mut &str) -> ModalResult<Argument> {
    alt((
        // Parse kwarg first because it's more specific
        separated_pair(
            ws(identifier),
            one_of([':', '=']),
            logical_expression,
        )
        .map(|(name, expression)| Argument::Keyword(name, expression))
        .context(ctx_label("keyword argument")),
        logical_expression
            .map(Argument::Position)
            .context(ctx_label("positional argument")),
    ))
    .parse_next(input)
}

/// Validate a mixed argument list: positional arguments must precede keyword
/// arguments, and keyword names must be unique
fn unpack_arguments(
    arguments: Vec<Argument>,
    input: &mut &str,
) -> ModalResult<(Vec<Expression>, IndexMap<Identifier, Expression>)> {
    let mut position: Vec<Expression> = Vec::new();
    let mut keyword: IndexMap<Identifier, Expression> = IndexMap::new();
    for argument in arguments {
        match argument {
            Argument::Position(expression) => {
                if !keyword.is_empty() {
                    return cut_err(fail)
                        .context(ctx_label(
                            "positional argument after keyword argument",
                        ))
                        .parse_next(input);
                }
                position.push(expression);
            }
            Argument::Keyword(name, expression) => {
                if keyword.insert(name, expression).is_some() {
                    return cut_err(fail)
                        .context(ctx_label("duplicate keyword argument"))
                        .parse_next(input);
                }
            }
        }
    }
    Ok((position, keyword))
}

/// Parse a function call argument list: `(a, b, key: c)`
fn call_arguments(
    input: &mut &str,
) -> ModalResult<(Vec<Expression>, IndexMap<Identifier, Expression>)> {
    let arguments: Vec<Argument> = preceded(
        '(',
        // The open paren is unambiguous, so errors inside are fatal
        cut_err(terminated(
            ws(terminated(
                separated(0.., argument, ws(',')),
                opt(ws(',')),
            )),
            ')'.context(StrContext::Expected(StrContextValue::CharLiteral(
                ')',
            ))),
        )),
    )
    .context(ctx_label("function call"))
    .parse_next(input)?;
    unpack_arguments(arguments, input)
}

/// Parse one filter in a pipeline: `| name` or `| name: arg, key: arg`
fn filter_call(input: &mut &str) -> ModalResult<FilterCall> {
    let (name, arguments): (Identifier, Option<Vec<Argument>>) = preceded(
        ws('|'),
        // Once we've hit a |, only a filter can follow, so errors are fatal
        cut_err((
            ws(identifier.context(ctx_label("filter name"))),
            opt(preceded(
                ':',
                separated(1.., argument, ws(',')),
            )),
        )),
    )
    .context(ctx_label("filter"))
    .parse_next(input)?;
    let (position, keyword) =
        unpack_arguments(arguments.unwrap_or_default(), input)?;
    Ok(FilterCall {
        name,
        position,
        keyword,
    })
}

/// Parse a variable/member/filter name. See [Identifier] for the allowed
/// syntax.
fn identifier(input: &mut &str) -> ModalResult<Identifier> {
    (
        take_while(1, Identifier::is_char_allowed_first),
        take_while(0.., Identifier::is_char_allowed),
    )
        .take()
        .map(|id: &str| Identifier(id.to_owned()))
        .context(ctx_label("identifier"))
        .parse_next(input)
}

/// Require a bare word with a token boundary after it, so `in` doesn't match
/// the start of `inside`
fn word<'a>(
    keyword: &'static str,
) -> impl ModalParser<&'a str, &'a str, ContextError> {
    terminated(keyword, not(one_of(Identifier::is_char_allowed)))
}

/// Wrap a parser to allow whitespace on either side of it
fn ws<'a, O, F>(parser: F) -> impl ModalParser<&'a str, O, ContextError>
where
    F: ModalParser<&'a str, O, ContextError>,
{
    delimited(multispace0, parser, multispace0)
}

/// Create a [StrContext::Label]
fn ctx_label(label: &'static str) -> StrContext {
    StrContext::Label(label)
}

/// Create a [StrContext::Expected]
fn ctx_expected(expected: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use sluice_util::{assert_err, assert_matches};

    /// Test parsing individual expressions against expected ASTs
    #[rstest]
    // ===== Literals =====
    #[case::nil("nil", literal(Literal::Nil))]
    #[case::null_alias("null", literal(Literal::Nil))]
    #[case::bool_true("true", literal(Literal::Boolean(true)))]
    #[case::bool_false("false", literal(Literal::Boolean(false)))]
    #[case::empty("empty", literal(Literal::Empty))]
    #[case::blank("blank", literal(Literal::Blank))]
    #[case::int("17", number("17"))]
    #[case::int_negative("-10", number("-10"))]
    #[case::decimal_scale("1.50", number("1.50"))]
    #[case::string_single("'hello'", string("hello"))]
    #[case::string_double("\"hello\"", string("hello"))]
    #[case::string_empty("''", string(""))]
    // No escape sequences: backslash is literal
    #[case::string_backslash(r"'a\nb'", string(r"a\nb"))]
    // ===== Variables and access chains =====
    #[case::identifier("user", ident("user"))]
    #[case::member("a.b", member(ident("a"), "b"))]
    #[case::member_chain(
        "a.b.c",
        member(member(ident("a"), "b"), "c"),
    )]
    #[case::index("xs[0]", index(ident("xs"), number("0")))]
    #[case::index_string("xs['k']", index(ident("xs"), string("k")))]
    #[case::mixed_chain(
        "items[0].n",
        member(index(ident("items"), number("0")), "n"),
    )]
    // ===== Ranges =====
    #[case::range(
        "(1..3)",
        Expression::Range {
            start: Box::new(number("1")),
            end: Box::new(number("3")),
        },
    )]
    #[case::range_dynamic(
        "(1..n)",
        Expression::Range {
            start: Box::new(number("1")),
            end: Box::new(ident("n")),
        },
    )]
    // ===== Binary operators =====
    #[case::equal(
        "a == 1",
        binary(BinaryOperator::Equal, ident("a"), number("1")),
    )]
    #[case::not_equal_alias(
        "a <> 1",
        binary(BinaryOperator::NotEqual, ident("a"), number("1")),
    )]
    #[case::contains(
        "xs contains 'a'",
        binary(BinaryOperator::Contains, ident("xs"), string("a")),
    )]
    // and/or associate right-to-left with no mutual precedence
    #[case::logical_right_assoc(
        "a and b or c",
        binary(
            BinaryOperator::And,
            ident("a"),
            binary(BinaryOperator::Or, ident("b"), ident("c")),
        ),
    )]
    #[case::comparison_in_logical(
        "a > 1 and b",
        binary(
            BinaryOperator::And,
            binary(BinaryOperator::Greater, ident("a"), number("1")),
            ident("b"),
        ),
    )]
    // ===== Filters =====
    #[case::filter_bare("x | upcase", filter(ident("x"), "upcase", [], []))]
    #[case::filter_args(
        "x | append: 'y'",
        filter(ident("x"), "append", [string("y")], []),
    )]
    #[case::filter_kwargs(
        "x | default: 1, allow_false: true",
        filter(
            ident("x"),
            "default",
            [number("1")],
            [("allow_false", literal(Literal::Boolean(true)))],
        ),
    )]
    // Filters are left-associative
    #[case::filter_chain(
        "x | split: ',' | upcase",
        filter(
            filter(ident("x"), "split", [string(",")], []),
            "upcase",
            [],
            [],
        ),
    )]
    // ===== Function calls =====
    #[case::call(
        "f(1, mode: 'caps')",
        Expression::Call(FunctionCall {
            target: "f".into(),
            position: vec![number("1")],
            keyword: [("mode".into(), string("caps"))].into_iter().collect(),
        }),
    )]
    fn test_parse_expression(
        #[case] input: &str,
        #[case] expected: Expression,
    ) {
        let parsed = ws(filtered_expression)
            .parse(input)
            .unwrap_or_else(|error| panic!("{error}"));
        assert_eq!(parsed, expected);
    }

    /// Test expression parse error cases
    #[rstest]
    #[case::empty("", "expression")]
    #[case::leading_dot(".", "expression")]
    #[case::trailing_dot("bogus.", "identifier")]
    #[case::unclosed_string("'bogus", "expected `'`")]
    #[case::unclosed_index("xs[0", "expected `]`")]
    #[case::unclosed_range("(1..2", "expected `)`")]
    #[case::pipe_no_name("x |", "filter")]
    #[case::duplicate_kwarg(
        "x | f: a: 1, a: 2",
        "duplicate keyword argument"
    )]
    #[case::positional_after_kwarg(
        "f(a: 1, 2)",
        "positional argument after keyword argument"
    )]
    fn test_parse_expression_error(
        #[case] input: &str,
        #[case] expected_error: &str,
    ) {
        let result = ws(filtered_expression)
            .parse(input)
            .map_err(|error| anyhow::anyhow!(error.to_string()));
        assert_err!(result, expected_error);
    }

    /// Test scanning: text runs, delimiters, and whitespace stripping
    #[rstest]
    #[case::plain("hello", vec!["hello"])]
    #[case::trim_left("a  {{- x }}b", vec!["a", "b"])]
    #[case::trim_right("a{{ x -}}\n  b", vec!["a", "b"])]
    #[case::trim_tag("a \n {%- assign x = 1 -%} \n b", vec!["a", "b"])]
    #[case::no_trim("a {{ x }} b", vec!["a ", " b"])]
    fn test_tokenize_trimming(
        #[case] source: &str,
        #[case] expected_text: Vec<&str>,
    ) {
        let tokens = tokenize(source, &ParserConfig::default()).unwrap();
        let text: Vec<&str> = tokens
            .iter()
            .filter_map(|token| match token {
                Token::Text(text) => Some(*text),
                _ => None,
            })
            .collect();
        assert_eq!(text, expected_text);
    }

    /// Close delimiters inside string literals don't end the token
    #[test]
    fn test_tokenize_quoted_delimiter() {
        let tokens =
            tokenize("{{ '}}' }}", &ParserConfig::default()).unwrap();
        assert_matches!(
            tokens.as_slice(),
            [Token::Output { source: " '}}' ", .. }],
        );
    }

    /// Raw interiors are captured without tokenization
    #[test]
    fn test_tokenize_raw() {
        let tokens = tokenize(
            "a{% raw %}{{ not parsed }}{% endraw %}b",
            &ParserConfig::default(),
        )
        .unwrap();
        assert_matches!(
            tokens.as_slice(),
            [
                Token::Text("a"),
                Token::Tag { name: "raw", .. },
                Token::Text("{{ not parsed }}"),
                Token::Tag { name: "endraw", .. },
                Token::Text("b"),
            ],
        );
    }

    /// Scanner error cases carry offsets
    #[rstest]
    #[case::unterminated_output("ab{{ x", 2, "unterminated `{{`")]
    #[case::unterminated_tag("{% if x", 0, "unterminated `{%`")]
    #[case::missing_tag_name("{%  %}", 4, "expected tag name")]
    #[case::unclosed_raw("{% raw %}stuff", 3, "unclosed `raw` block")]
    fn test_tokenize_error(
        #[case] source: &str,
        #[case] expected_offset: usize,
        #[case] expected_error: &str,
    ) {
        let error = tokenize(source, &ParserConfig::default()).unwrap_err();
        assert_eq!(error.offset(), expected_offset);
        assert!(
            error.to_string().contains(expected_error),
            "expected {expected_error:?} in {error}"
        );
    }

    /// Tag arguments spanning newlines are rejected without the greedy option
    #[test]
    fn test_non_greedy_newline() {
        let config = ParserConfig {
            greedy: false,
            ..ParserConfig::default()
        };
        assert_err!(
            tokenize("{% assign x\n= 1 %}", &config)
                .map_err(anyhow::Error::from),
            "may not span newlines"
        );
        // Greedy (the default) allows it
        assert!(
            tokenize("{% assign x\n= 1 %}", &ParserConfig::default()).is_ok()
        );
    }

    /// Template-level parse errors: unknown and unterminated tags
    #[rstest]
    #[case::unknown_tag("{% bogus %}", "unknown tag `bogus`")]
    #[case::stray_end("{% endif %}", "unexpected `{% endif %}`")]
    #[case::unterminated_block(
        "{% if true %}x",
        "expected `{% elsif %}` or `{% else %}` or `{% endif %}`"
    )]
    #[case::trailing_args(
        "{% increment counter bogus %}",
        "unexpected trailing content"
    )]
    fn test_parse_template_error(
        #[case] source: &str,
        #[case] expected_error: &str,
    ) {
        let parser = Parser::new();
        assert_err!(parser.parse(source), expected_error);
    }

    /// Registering a custom identifier tag extends the grammar
    #[test]
    fn test_register_identifier_tag() {
        let mut parser = Parser::new();
        parser.register_identifier_tag("poke", Statement::Increment);
        let template = parser.parse("{% poke counter %}").unwrap();
        assert_matches!(
            template.statements(),
            [Statement::Increment(name)] if name.as_str() == "counter",
        );
    }

    /// Shorthand for a literal expression
    fn literal(literal: Literal) -> Expression {
        Expression::Literal(literal)
    }

    /// Shorthand for a number literal, preserving the written scale
    fn number(source: &str) -> Expression {
        literal(Literal::Number(source.parse().unwrap()))
    }

    /// Shorthand for a string literal
    fn string(s: &str) -> Expression {
        literal(Literal::String(s.into()))
    }

    /// Shorthand for an identifier expression
    fn ident(name: &str) -> Expression {
        Expression::Identifier(name.into())
    }

    /// Shorthand for a member access
    fn member(object: Expression, name: &str) -> Expression {
        Expression::Member {
            object: Box::new(object),
            name: name.into(),
        }
    }

    /// Shorthand for an index access
    fn index(object: Expression, i: Expression) -> Expression {
        Expression::Index {
            object: Box::new(object),
            index: Box::new(i),
        }
    }

    /// Shorthand for a binary operator expression
    fn binary(
        operator: BinaryOperator,
        lhs: Expression,
        rhs: Expression,
    ) -> Expression {
        Expression::Binary {
            operator,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Shorthand for a filter application
    fn filter<const P: usize, const K: usize>(
        input: Expression,
        name: &str,
        position: [Expression; P],
        keyword: [(&str, Expression); K],
    ) -> Expression {
        Expression::Filter {
            input: Box::new(input),
            call: FilterCall {
                name: name.into(),
                position: position.into(),
                keyword: keyword
                    .into_iter()
                    .map(|(name, expression)| (name.into(), expression))
                    .collect(),
            },
        }
    }
}
