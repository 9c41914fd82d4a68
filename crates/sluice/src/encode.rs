//! Context-sensitive output escaping
//!
//! Every string an output statement produces passes through the context's
//! encoder exactly once. Raw template text and pre-escaped markup bypass it.

use itertools::Itertools;

/// Escapes text on its way into the output document
pub trait TextEncoder: Send + Sync {
    fn encode(&self, out: &mut String, text: &str);
}

/// HTML-escapes `&`, `<`, `>`, `"`, and `'`. The default encoder.
#[derive(Copy, Clone, Debug, Default)]
pub struct HtmlEncoder;

impl TextEncoder for HtmlEncoder {
    fn encode(&self, out: &mut String, text: &str) {
        escape_html(out, text);
    }
}

/// Writes text through untouched, for plain-text output
#[derive(Copy, Clone, Debug, Default)]
pub struct NullEncoder;

impl TextEncoder for NullEncoder {
    fn encode(&self, out: &mut String, text: &str) {
        out.push_str(text);
    }
}

/// Percent-encodes for URL components
#[derive(Copy, Clone, Debug, Default)]
pub struct UrlEncoder;

impl TextEncoder for UrlEncoder {
    fn encode(&self, out: &mut String, text: &str) {
        out.push_str(&percent_encode(text));
    }
}

/// Append `text` to `out`, HTML-escaping as we go. Shared by [HtmlEncoder]
/// and the `escape` filters.
pub(crate) fn escape_html(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

/// Form-style percent encoding (spaces become `+`)
pub(crate) fn percent_encode(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

/// Reverse of [percent_encode]: `+` becomes a space, `%XX` pairs decode.
/// Malformed escapes pass through literally; decoding never fails.
pub(crate) fn percent_decode(text: &str) -> String {
    let mut bytes = Vec::with_capacity(text.len());
    let mut iter = text.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                // Peek two hex digits; fall back to a literal % if malformed
                let mut pair = iter.clone();
                match pair.next_tuple().and_then(|(hi, lo)| {
                    let hex = [hi, lo];
                    u8::from_str_radix(str::from_utf8(&hex).ok()?, 16).ok()
                }) {
                    Some(decoded) => {
                        bytes.push(decoded);
                        iter = pair;
                    }
                    None => bytes.push(b'%'),
                }
            }
            b => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
