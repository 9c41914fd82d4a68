//! String filters

use super::FilterRegistry;
use crate::{
    encode::{escape_html, percent_decode, percent_encode},
    error::RenderError,
    value::{Arguments, Value},
};
use regex::Regex;
use std::sync::LazyLock;

pub(super) fn register(registry: &mut FilterRegistry) {
    registry.register_fn("append", append);
    registry.register_fn("capitalize", capitalize);
    registry.register_fn("downcase", downcase);
    registry.register_fn("escape", escape);
    registry.register_fn("escape_once", escape_once);
    registry.register_fn("lstrip", lstrip);
    registry.register_fn("newline_to_br", newline_to_br);
    registry.register_fn("prepend", prepend);
    registry.register_fn("remove", remove);
    registry.register_fn("remove_first", remove_first);
    registry.register_fn("replace", replace);
    registry.register_fn("replace_first", replace_first);
    registry.register_fn("rstrip", rstrip);
    registry.register_fn("slice", slice);
    registry.register_fn("split", split);
    registry.register_fn("strip", strip);
    registry.register_fn("strip_html", strip_html);
    registry.register_fn("strip_newlines", strip_newlines);
    registry.register_fn("truncate", truncate);
    registry.register_fn("truncatewords", truncatewords);
    registry.register_fn("upcase", upcase);
    registry.register_fn("url_decode", url_decode);
    registry.register_fn("url_encode", url_encode);
}

fn append(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let suffix: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(format!("{input}{suffix}").into())
}

fn prepend(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let prefix: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(format!("{prefix}{input}").into())
}

/// Uppercase the first character, lowercase the rest
fn capitalize(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    let text = input.to_string();
    let mut chars = text.chars();
    let capitalized = match chars.next() {
        Some(first) => {
            first.to_uppercase().collect::<String>()
                + &chars.as_str().to_lowercase()
        }
        None => String::new(),
    };
    Ok(capitalized.into())
}

fn downcase(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().to_lowercase().into())
}

fn upcase(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().to_uppercase().into())
}

/// HTML-escape the input. Returns markup so the output encoder doesn't
/// escape it a second time.
fn escape(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    let mut escaped = String::new();
    escape_html(&mut escaped, &input.to_string());
    Ok(Value::Markup(escaped))
}

/// Like `escape`, but existing entities are left alone instead of being
/// double-escaped
fn escape_once(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new("&(?:[a-zA-Z]+|#[0-9]+|#x[0-9a-fA-F]+);").unwrap()
    });

    arguments.ensure_consumed()?;
    let text = input.to_string();
    let mut escaped = String::with_capacity(text.len());
    let mut copied = 0;
    for entity in ENTITY.find_iter(&text) {
        escape_html(&mut escaped, &text[copied..entity.start()]);
        escaped.push_str(entity.as_str());
        copied = entity.end();
    }
    escape_html(&mut escaped, &text[copied..]);
    Ok(Value::Markup(escaped))
}

fn lstrip(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().trim_start().to_owned().into())
}

fn rstrip(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().trim_end().to_owned().into())
}

fn strip(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().trim().to_owned().into())
}

fn newline_to_br(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_string().replace('\n', "<br />\n").into())
}

fn remove(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let needle: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(input.to_string().replace(&needle, "").into())
}

fn remove_first(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let needle: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(input.to_string().replacen(&needle, "", 1).into())
}

fn replace(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let needle: String = arguments.pop_position()?;
    let replacement: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(input.to_string().replace(&needle, &replacement).into())
}

fn replace_first(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let needle: String = arguments.pop_position()?;
    let replacement: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok(input.to_string().replacen(&needle, &replacement, 1).into())
}

/// Take a substring (or subsequence, for arrays) starting at `start`, of the
/// given length (default 1). Negative starts count from the end.
fn slice(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let start: i64 = arguments.pop_position()?;
    let length: Option<usize> = arguments.pop_optional()?;
    arguments.ensure_consumed()?;
    let length = length.unwrap_or(1);

    fn bounds(len: usize, start: i64, length: usize) -> (usize, usize) {
        let len = len as i64;
        let begin = if start < 0 {
            (len + start).max(0)
        } else {
            start.min(len)
        } as usize;
        (begin, length)
    }

    match input {
        Value::Array(items) => {
            let (begin, length) = bounds(items.len(), start, length);
            Ok(Value::Array(
                items.into_iter().skip(begin).take(length).collect(),
            ))
        }
        value => {
            let text = value.to_string();
            let (begin, length) =
                bounds(text.chars().count(), start, length);
            Ok(text
                .chars()
                .skip(begin)
                .take(length)
                .collect::<String>()
                .into())
        }
    }
}

/// Split a string into an array. An empty separator splits into characters.
/// Trailing empty segments are dropped, following Ruby's split.
fn split(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let separator: String = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    let text = input.to_string();
    let mut parts: Vec<Value> = if text.is_empty() {
        Vec::new()
    } else if separator.is_empty() {
        text.chars().map(|c| c.to_string().into()).collect()
    } else {
        text.split(&separator).map(Value::from).collect()
    };
    while let Some(Value::String(last)) = parts.last()
        && last.is_empty()
    {
        parts.pop();
    }
    Ok(Value::Array(parts))
}

/// Remove HTML tags, comments, and script/style bodies
fn strip_html(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    static BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?is)<script.*?</script>|<style.*?</style>|<!--.*?-->",
        )
        .unwrap()
    });
    static TAGS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

    arguments.ensure_consumed()?;
    let text = input.to_string();
    let text = BLOCKS.replace_all(&text, "");
    let text = TAGS.replace_all(&text, "");
    Ok(text.into_owned().into())
}

fn strip_newlines(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input
        .to_string()
        .replace(['\r', '\n'], "")
        .into())
}

/// Shorten a string to `length` characters, ellipsis included in the count
fn truncate(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let length: usize = arguments.pop_position()?;
    let ellipsis: Option<String> = arguments.pop_optional()?;
    arguments.ensure_consumed()?;
    let ellipsis = ellipsis.unwrap_or_else(|| "...".into());
    let text = input.to_string();
    if text.chars().count() <= length {
        return Ok(text.into());
    }
    let keep = length.saturating_sub(ellipsis.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(&ellipsis);
    Ok(truncated.into())
}

/// Shorten a string to `count` words, appending the ellipsis if anything was
/// dropped
fn truncatewords(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let count: usize = arguments.pop_position()?;
    let ellipsis: Option<String> = arguments.pop_optional()?;
    arguments.ensure_consumed()?;
    let ellipsis = ellipsis.unwrap_or_else(|| "...".into());
    let text = input.to_string();
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= count {
        return Ok(text.into());
    }
    let mut truncated = words[..count.max(1)].join(" ");
    truncated.push_str(&ellipsis);
    Ok(truncated.into())
}

fn url_encode(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(percent_encode(&input.to_string()).into())
}

fn url_decode(
    input: Value,
    arguments: Arguments,
) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(percent_decode(&input.to_string()).into())
}
