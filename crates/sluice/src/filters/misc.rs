//! `date` and `default`

use super::{Filter, FilterRegistry};
use crate::{
    context::RenderContext,
    error::RenderError,
    value::{Arguments, Value},
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use futures::future::BoxFuture;
use std::fmt::Write;

pub(super) fn register(registry: &mut FilterRegistry) {
    registry.register("date", DateFilter);
    registry.register_fn("default", default);
}

/// Fall back when the input is nil, false, or empty. `allow_false: true`
/// keeps false inputs.
fn default(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let fallback: Value = arguments.pop_position()?;
    let allow_false: Option<bool> = arguments.pop_keyword("allow_false")?;
    arguments.ensure_consumed()?;
    let use_fallback = match &input {
        Value::Nil => true,
        Value::Boolean(false) => !allow_false.unwrap_or(false),
        value => value.equals(&Value::Empty),
    };
    Ok(if use_fallback { fallback } else { input })
}

/// `date: '%Y-%m-%d'`: strftime-format a date. The input can be a date
/// value, a parseable date string, `"now"`/`"today"`, or a unix timestamp.
/// Unparseable inputs and invalid format strings pass the input through
/// unchanged; formatting never fails a render.
struct DateFilter;

impl Filter for DateFilter {
    fn apply<'a>(
        &'a self,
        input: Value,
        mut arguments: Arguments,
        cx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        Box::pin(async move {
            let format: String = arguments.pop_position()?;
            arguments.ensure_consumed()?;
            if format.is_empty() {
                return Ok(input);
            }

            let date = match &input {
                Value::DateTime(date) => Some(*date),
                Value::String(s) | Value::Markup(s) => parse_date(s, cx),
                Value::Number(_) => DateTime::from_timestamp(
                    input.to_integer(),
                    0,
                )
                .map(|date| date.with_timezone(&cx.timezone())),
                _ => None,
            };
            let Some(date) = date else {
                return Ok(input);
            };

            // chrono surfaces invalid format specifiers as fmt errors;
            // swallow those into the input-unchanged policy
            let mut formatted = String::new();
            match write!(formatted, "{}", date.format(&format)) {
                Ok(()) => Ok(formatted.into()),
                Err(_) => Ok(input),
            }
        })
    }
}

/// Parse a date string, trying the clock keywords and then progressively
/// simpler formats. Naive formats are interpreted in the context's timezone.
fn parse_date(s: &str, cx: &RenderContext) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if s == "now" || s == "today" {
        return Some(cx.now());
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(s) {
        return Some(date);
    }
    let timezone = cx.timezone();
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return timezone.from_local_datetime(&naive).single();
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    timezone
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
}
