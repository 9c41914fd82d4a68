//! End-to-end rendering tests: the full parse → render pipeline against
//! real templates

use crate::{
    Control, Culture, CustomTag, FunctionValue, HostObject, MemberAccessStrategy,
    MemoryLoader, ObjectMembers, Output, Parser, RenderContext, RenderError,
    Statement, TemplateOptions, Value,
};
use chrono::DateTime;
use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use proptest::proptest;
use rstest::rstest;
use sluice_util::{assert_err, assert_matches};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Render with default options and panic on any failure
async fn render(source: &str, model: Value) -> String {
    try_render(source, model, TemplateOptions::default())
        .await
        .unwrap()
}

async fn try_render(
    source: &str,
    model: Value,
    options: TemplateOptions,
) -> Result<String, RenderError> {
    let template = Parser::new().parse(source).expect("parse failed");
    let mut cx = RenderContext::new(model, Arc::new(options));
    template.render(&mut cx).await
}

/// A loader with the partials the include/render tests use
fn loader() -> MemoryLoader {
    MemoryLoader::new()
        .with_template("card.liquid", "[{{ who }}]")
        .with_template("titled.liquid", "[{{ title }}]")
        .with_template("spy.liquid", "[{{ secret }}{{ m }}{{ p }}]")
        .with_template("a.liquid", "{% include 'b' %}")
        .with_template("b.liquid", "{% include 'a' %}")
        .with_template("chain1.liquid", "{% include 'chain2' %}")
        .with_template("chain2.liquid", "{% include 'chain3' %}")
        .with_template("chain3.liquid", "x")
        .with_template("broken.liquid", "{{")
}

fn options_with_loader() -> TemplateOptions {
    TemplateOptions {
        loader: Some(Arc::new(loader())),
        ..TemplateOptions::default()
    }
}

/// The core end-to-end scenarios
#[rstest]
#[case::interpolation(
    "Hello {{ name }}!",
    Value::from(vec![("name", "World")]),
    "Hello World!",
)]
#[case::loop_break(
    "{% for i in (1..3) %}{{ i }}{% if i == 2 %}{% break %}{% endif %}{% endfor %}",
    Value::Nil,
    "12",
)]
#[case::split_join_upcase(
    r#"{% assign xs = "a,b,c" | split: "," %}{{ xs | join: "-" | upcase }}"#,
    Value::Nil,
    "A-B-C",
)]
#[case::capture(
    "{% capture g %}{{ 'x' | append: 'y' }}{% endcapture %}[{{ g }}]",
    Value::Nil,
    "[xy]",
)]
#[case::if_member_index(
    "{% if items.size > 0 %}{{ items[0].n }}{% else %}none{% endif %}",
    serde_json::json!({"items": [{"n": 42}]}).into(),
    "42",
)]
#[case::html_escaping(
    "<b>{{ raw }}</b>",
    Value::from(vec![("raw", "<i>&</i>")]),
    "<b>&lt;i&gt;&amp;&lt;/i&gt;</b>",
)]
#[tokio::test]
async fn test_scenarios(
    #[case] source: &str,
    #[case] model: Value,
    #[case] expected: &str,
) {
    assert_eq!(render(source, model).await, expected);
}

/// Templates with no statements render to the empty string
#[tokio::test]
async fn test_empty_template() {
    assert_eq!(render("", Value::Nil).await, "");
}

/// Language features beyond the core scenarios
#[rstest]
#[case::unless("{% unless x %}no-x{% endunless %}", "no-x")]
#[case::elsif(
    "{% if false %}a{% elsif true %}b{% else %}c{% endif %}",
    "b",
)]
#[case::case_multi_value(
    "{% assign x = 4 %}\
     {% case x %}{% when 1, 2 %}low{% when 3 or 4 %}mid{% else %}high{% endcase %}",
    "mid",
)]
#[case::case_else(
    "{% case 9 %}{% when 1 %}one{% else %}other{% endcase %}",
    "other",
)]
#[case::for_else("{% for i in xs %}x{% else %}none{% endfor %}", "none")]
#[case::for_window(
    "{% for i in (1..5) limit: 2 offset: 1 %}{{ i }}{% endfor %}",
    "23",
)]
#[case::for_reversed_window(
    "{% for i in (1..5) reversed limit: 2 offset: 1 %}{{ i }}{% endfor %}",
    "32",
)]
#[case::continue_skips(
    "{% for i in (1..4) %}{% if i == 2 %}{% continue %}{% endif %}{{ i }}{% endfor %}",
    "134",
)]
#[case::forloop_members(
    "{% for i in (1..3) %}{{ forloop.index }}{{ forloop.rindex }};{% endfor %}",
    "13;22;31;",
)]
#[case::forloop_first_last(
    "{% for i in (1..3) %}{% if forloop.first %}[{% endif %}{{ i }}{% if forloop.last %}]{% endif %}{% endfor %}",
    "[123]",
)]
#[case::parentloop(
    "{% for i in (1..2) %}{% for j in (1..2) %}{{ forloop.parentloop.index }}{{ forloop.index }} {% endfor %}{% endfor %}",
    "11 12 21 22 ",
)]
#[case::cycle(
    "{% for i in (1..4) %}{% cycle 'a', 'b' %}{% endfor %}",
    "abab",
)]
#[case::cycle_grouped(
    "{% cycle 'g': 'a', 'b' %}{% cycle 'g': 'a', 'b' %}{% cycle 'h': 'a', 'b' %}",
    "aba",
)]
#[case::increment_decrement(
    "{% increment c %}{% increment c %}{% decrement c %}",
    "011",
)]
#[case::echo("{% echo 'hi' | upcase %}", "HI")]
#[case::raw_block("{% raw %}{{ x }}{% endraw %}", "{{ x }}")]
#[case::comment_block("a{% comment %} {{ junk }} here {% endcomment %}b", "ab")]
#[case::contains_operator("{% if 'abc' contains 'b' %}y{% endif %}", "y")]
#[case::equality_empty("{% assign s = '' %}{% if s == empty %}e{% endif %}", "e")]
#[case::iterate_dictionary(
    "{% for pair in dict %}{{ pair[0] }}={{ pair[1] }};{% endfor %}",
    "a=1;b=2;",
)]
#[tokio::test]
async fn test_language_features(#[case] source: &str, #[case] expected: &str) {
    let model = Value::from(vec![("dict", Value::from(vec![("a", 1), ("b", 2)]))]);
    assert_eq!(render(source, model).await, expected);
}

/// Numbers preserve their written scale through equality and rendering
#[tokio::test]
async fn test_number_scale() {
    let actual = render(
        "{% if 1.0 == 1 %}eq {% endif %}{{ 1.0 }}|{{ 1 }}|{{ 2.50 }}",
        Value::Nil,
    )
    .await;
    assert_eq!(actual, "eq 1.0|1|2.50");
}

/// Undefined variables, members, and indexes are nil, rendering as nothing
#[tokio::test]
async fn test_undefined_is_nil() {
    let actual = render(
        "[{{ ghost }}|{{ ghost.member }}|{{ xs[9] }}]",
        Value::from(vec![("xs", Value::Array(vec![]))]),
    )
    .await;
    assert_eq!(actual, "[||]");
}

/// The loop guard: body runs exactly max(0, min(limit, n - offset)) times
#[rstest]
#[case::plain(None, None, 5)]
#[case::limit(Some(3), None, 3)]
#[case::offset(None, Some(2), 3)]
#[case::both(Some(2), Some(2), 2)]
#[case::offset_past_end(None, Some(9), 0)]
#[case::limit_past_end(Some(9), Some(4), 1)]
#[tokio::test]
async fn test_loop_guard(
    #[case] limit: Option<usize>,
    #[case] offset: Option<usize>,
    #[case] expected: usize,
) {
    let mut source = String::from("{% for i in (1..5)");
    if let Some(limit) = limit {
        source.push_str(&format!(" limit: {limit}"));
    }
    if let Some(offset) = offset {
        source.push_str(&format!(" offset: {offset}"));
    }
    source.push_str(" %}x{% endfor %}");
    let actual = render(&source, Value::Nil).await;
    assert_eq!(actual.len(), expected);
}

/// Rendering is pure: equal contexts produce bit-identical output
#[tokio::test]
async fn test_render_purity() {
    let source = "{% for i in (1..3) %}{{ i | times: 2 }};{% endfor %}\
                  {% assign x = 'v' %}{{ x | upcase }}";
    let first = render(source, Value::Nil).await;
    let second = render(source, Value::Nil).await;
    assert_eq!(first, second);
}

proptest! {
    /// Any string without template delimiters renders to itself
    #[test]
    fn test_raw_round_trip(source in r"[^{]*") {
        let rendered = futures::executor::block_on(async {
            render(&source, Value::Nil).await
        });
        assert_eq!(rendered, source);
    }
}

/// `assign` then output renders the literal's string form
#[rstest]
#[case::string("'v'", "v")]
#[case::integer("42", "42")]
#[case::decimal("1.50", "1.50")]
#[case::boolean("false", "false")]
#[case::range("(1..3)", "1..3")]
#[tokio::test]
async fn test_assign_output(#[case] literal: &str, #[case] expected: &str) {
    let source = format!("{{% assign x = {literal} %}}{{{{ x }}}}");
    assert_eq!(render(&source, Value::Nil).await, expected);
}

// === Encoding ===

/// The escape filter produces markup, so the HTML encoder doesn't escape it
/// a second time
#[tokio::test]
async fn test_escape_encodes_once() {
    let actual =
        render("{{ s | escape }}", Value::from(vec![("s", "a < b")])).await;
    assert_eq!(actual, "a &lt; b");
}

/// Capture buffers are encoded as written; re-emitting them is a raw write
#[tokio::test]
async fn test_capture_encodes_once() {
    let source =
        "{% capture g %}<b>{{ x }}</b>{% endcapture %}{{ g }}";
    let actual = render(source, Value::from(vec![("x", "&")])).await;
    assert_eq!(actual, "<b>&amp;</b>");
}

// === Whitespace control ===

#[rstest]
#[case::dashes("a  {{- 'x' -}}  b", "axb")]
#[case::tag_dashes("a\n{%- assign v = 1 -%}\nb", "ab")]
#[case::one_side("a {{- 'x' }} b", "ax b")]
#[tokio::test]
async fn test_whitespace_dashes(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, Value::Nil).await, expected);
}

/// Parser-level default trimming options
#[tokio::test]
async fn test_trim_options() {
    let mut parser = Parser::new();
    parser.trim_tags(true);
    let template = parser.parse("a \n{% assign v = 1 %}\n b").unwrap();
    let mut cx =
        RenderContext::new(Value::Nil, Arc::new(TemplateOptions::default()));
    assert_eq!(template.render(&mut cx).await.unwrap(), "ab");
}

// === Includes and partials ===

#[tokio::test]
async fn test_include_shares_scope() {
    let source = "{% assign who = 'W' %}{% include 'card' %}";
    let actual = try_render(source, Value::Nil, options_with_loader())
        .await
        .unwrap();
    assert_eq!(actual, "[W]");
}

#[tokio::test]
async fn test_include_parameters() {
    let actual = try_render(
        "{% include 'titled', title: 'T' %}",
        Value::Nil,
        options_with_loader(),
    )
    .await
    .unwrap();
    assert_eq!(actual, "[T]");
}

/// `render` isolates the parent scope: only parameters and the model are
/// visible
#[tokio::test]
async fn test_render_isolates_scope() {
    let source = "{% assign secret = 'S' %}{% render 'spy', p: 'P' %}";
    let model = Value::from(vec![("m", "M")]);
    let actual = try_render(source, model, options_with_loader())
        .await
        .unwrap();
    assert_eq!(actual, "[MP]");
}

#[tokio::test]
async fn test_include_cycle_detected() {
    let result =
        try_render("{% include 'a' %}", Value::Nil, options_with_loader())
            .await;
    assert_matches!(result, Err(RenderError::CyclicInclude { ref name }) if name == "a");
}

#[tokio::test]
async fn test_include_depth_guard() {
    let options = TemplateOptions {
        max_recursion: 2,
        ..options_with_loader()
    };
    let result = try_render("{% include 'chain1' %}", Value::Nil, options).await;
    assert_matches!(result, Err(RenderError::RecursionLimit { max: 2 }));
}

#[tokio::test]
async fn test_include_not_found() {
    let result = try_render(
        "{% include 'nope' %}",
        Value::Nil,
        options_with_loader(),
    )
    .await;
    assert_err!(result, "template `nope` not found");
}

/// A child template that fails to parse surfaces as an evaluation error
/// naming the template
#[tokio::test]
async fn test_include_child_parse_error() {
    let result = try_render(
        "{% include 'broken' %}",
        Value::Nil,
        options_with_loader(),
    )
    .await;
    assert_err!(result, "error parsing template `broken`");
}

// === Guards and cancellation ===

#[tokio::test]
async fn test_cancellation() {
    let template = Parser::new()
        .parse("{% for i in (1..100) %}x{% endfor %}")
        .unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let mut cx =
        RenderContext::new(Value::Nil, Arc::new(TemplateOptions::default()))
            .with_cancellation(token);
    assert_matches!(
        template.render(&mut cx).await,
        Err(RenderError::Cancelled)
    );
}

#[tokio::test]
async fn test_iteration_guard() {
    let options = TemplateOptions {
        max_iterations: Some(10),
        ..TemplateOptions::default()
    };
    let result = try_render(
        "{% for i in (1..100) %}x{% endfor %}",
        Value::Nil,
        options,
    )
    .await;
    assert_matches!(result, Err(RenderError::IterationLimit { max: 10 }));
}

#[tokio::test]
async fn test_output_budget() {
    let options = TemplateOptions {
        max_output: Some(4),
        ..TemplateOptions::default()
    };
    let result = try_render("{{ 'toolong' }}", Value::Nil, options).await;
    assert_matches!(result, Err(RenderError::OutputLimit { max: 4 }));
}

/// The scope stack is balanced after rendering, even when the render fails
/// partway through a block
#[tokio::test]
async fn test_scope_balance_on_error() {
    let template = Parser::new()
        .parse("{% for i in (1..3) %}{{ i | bogus }}{% endfor %}")
        .unwrap();
    let mut cx =
        RenderContext::new(Value::Nil, Arc::new(TemplateOptions::default()));
    let depth_before = cx.scope_depth();
    assert_matches!(
        template.render(&mut cx).await,
        Err(RenderError::FilterUnknown { .. })
    );
    assert_eq!(cx.scope_depth(), depth_before);
}

#[tokio::test]
async fn test_unknown_filter() {
    let result = try_render(
        "{{ 1 | fake }}",
        Value::Nil,
        TemplateOptions::default(),
    )
    .await;
    assert_err!(result, "unknown filter `fake`");
}

// === Ambient configuration ===

/// The clock override pins `now` for deterministic dates
#[tokio::test]
async fn test_date_filter_with_clock_override() {
    let options = TemplateOptions {
        now: Some(
            DateTime::parse_from_rfc3339("2024-05-01T12:30:00+00:00").unwrap(),
        ),
        ..TemplateOptions::default()
    };
    let actual = try_render(
        "{{ 'now' | date: '%Y-%m-%d %H:%M' }} / {{ '2021-03-04' | date: '%d.%m.%Y' }}",
        Value::Nil,
        options,
    )
    .await
    .unwrap();
    assert_eq!(actual, "2024-05-01 12:30 / 04.03.2021");
}

/// Culture controls the numeric decimal separator
#[tokio::test]
async fn test_culture_separator() {
    let options = TemplateOptions {
        culture: Culture {
            decimal_separator: ',',
        },
        ..TemplateOptions::default()
    };
    let actual = try_render("{{ 1.5 }}", Value::Nil, options).await.unwrap();
    assert_eq!(actual, "1,5");
}

// === Host extension points ===

/// Function values invoke with call syntax and mixed arguments
#[tokio::test]
async fn test_function_value() {
    let template = Parser::new()
        .parse("{{ add(40, b: 2) }} {{ nope() }}")
        .unwrap();
    let mut cx =
        RenderContext::new(Value::Nil, Arc::new(TemplateOptions::default()));
    cx.set_variable(
        "add",
        FunctionValue::from_fn(|mut arguments| {
            let a: i64 = arguments.pop_position()?;
            let b: i64 = arguments.pop_keyword("b")?.unwrap_or(0);
            arguments.ensure_consumed()?;
            Ok((a + b).into())
        }),
    );
    // Calling a non-function is an error
    assert_matches!(
        template.render(&mut cx).await,
        Err(RenderError::NotCallable { ref name }) if name == "nope"
    );
    // But the working call renders
    let template = Parser::new().parse("{{ add(40, b: 2) }}").unwrap();
    assert_eq!(template.render(&mut cx).await.unwrap(), "42");
}

/// Registered accessors expose host object members; nothing else does
#[tokio::test]
async fn test_object_accessors() {
    struct Product {
        name: &'static str,
    }

    let mut options = TemplateOptions::default();
    options
        .accessors
        .register::<Product, _>("name", |product| product.name.into());
    let model = Value::from(vec![(
        "product",
        options.to_value(Product { name: "Widget" }),
    )]);
    let actual = try_render(
        "{{ product.name }}|{{ product.price }}",
        model,
        options,
    )
    .await
    .unwrap();
    // Unregistered members are nil, not errors
    assert_eq!(actual, "Widget|");
}

/// Accessor registries are layered: a getter registered on the context
/// overrides the one from the options for that render
#[tokio::test]
async fn test_context_accessors_override_options() {
    struct Product {
        name: &'static str,
    }

    let mut options = TemplateOptions::default();
    options
        .accessors
        .register::<Product, _>("name", |product| product.name.into());
    let model = Value::from(vec![(
        "product",
        options.to_value(Product { name: "base" }),
    )]);

    let template = Parser::new().parse("{{ product.name }}").unwrap();
    let mut cx = RenderContext::new(model, Arc::new(options));
    cx.accessors_mut()
        .register::<Product, _>("name", |_| "overridden".into());
    assert_eq!(template.render(&mut cx).await.unwrap(), "overridden");
}

/// Under the safe strategy, `ObjectMembers` needs an explicit allow; the
/// unsafe strategy uses it for any type
#[tokio::test]
async fn test_member_access_strategy() {
    struct Config {
        port: u16,
    }

    impl ObjectMembers for Config {
        fn get_member(&self, name: &str) -> Value {
            match name {
                "port" => u32::from(self.port).into(),
                _ => Value::Nil,
            }
        }
    }

    let object = || HostObject::reflective(Config { port: 8080 });

    // Safe (default): members are not reachable without an allow
    let options = TemplateOptions::default();
    let model = Value::from(vec![("config", options.classify(object()))]);
    let actual = try_render("[{{ config.port }}]", model, options)
        .await
        .unwrap();
    assert_eq!(actual, "[]");

    // Unsafe: members resolve
    let options = TemplateOptions {
        member_access: MemberAccessStrategy::Unsafe,
        ..TemplateOptions::default()
    };
    let model = Value::from(vec![("config", options.classify(object()))]);
    let actual = try_render("[{{ config.port }}]", model, options)
        .await
        .unwrap();
    assert_eq!(actual, "[8080]");

    // Safe with an explicit allow: members resolve
    let mut options = TemplateOptions::default();
    options.accessors.allow_members::<Config>();
    let model = Value::from(vec![("config", options.classify(object()))]);
    let actual = try_render("[{{ config.port }}]", model, options)
        .await
        .unwrap();
    assert_eq!(actual, "[8080]");
}

/// Custom tags plug into the grammar table and can terminate the render
#[tokio::test]
async fn test_custom_tag_terminate() {
    #[derive(Debug)]
    struct HaltTag;

    impl CustomTag for HaltTag {
        fn render<'a>(
            &'a self,
            _cx: &'a mut RenderContext,
            out: &'a mut Output,
        ) -> BoxFuture<'a, Result<Control, RenderError>> {
            Box::pin(async move {
                out.write_raw("!")?;
                Ok(Control::Terminate)
            })
        }
    }

    let mut parser = Parser::new();
    parser.register_empty_tag("halt", || {
        Statement::Custom(Arc::new(HaltTag))
    });
    let template = parser.parse("a{% halt %}b").unwrap();
    let mut cx =
        RenderContext::new(Value::Nil, Arc::new(TemplateOptions::default()));
    // Terminate halts the render; output up to that point survives
    assert_eq!(template.render(&mut cx).await.unwrap(), "a!");
}

/// Filter registration is last-writer-wins
#[tokio::test]
async fn test_filter_override() {
    let mut options = TemplateOptions::default();
    options
        .filters
        .register_fn("upcase", |input, arguments| {
            arguments.ensure_consumed()?;
            Ok(format!("!{input}!").into())
        });
    let actual = try_render("{{ 'x' | upcase }}", Value::Nil, options)
        .await
        .unwrap();
    assert_eq!(actual, "!x!");
}
