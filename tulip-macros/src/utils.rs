use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Builder options accepted as `key = value` attribute arguments.
const BUILDER_OPTIONS: [&str; 3] = ["read_buffer_size", "lost_write_threshold", "max_events"];

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Each argument is returned as a `Vec<TokenTree>`.
/// Commas at the top level are used as separators.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Converts a slice of tokens into a Rust source string.
///
/// Consecutive identifiers are separated by a space to avoid accidental
/// token merging (e.g. `foo bar` vs `foobar`).
pub(crate) fn tokens_to_string(tokens: &[TokenTree]) -> String {
    let mut out = String::new();
    let mut prev_was_ident = false;

    for t in tokens {
        let needs_space = prev_was_ident && matches!(t, TokenTree::Ident(_));

        if needs_space {
            out.push(' ');
        }

        out.push_str(&t.to_string());
        prev_was_ident = matches!(t, TokenTree::Ident(_));
    }

    out
}

/// Turns `read_buffer_size = 8192, max_events = 16` into the matching
/// `EventLoopBuilder` expression.
pub(crate) fn builder_expr(attr: TokenStream) -> String {
    let mut builder = String::from("::tulip::EventLoopBuilder::new()");

    for part in attr.to_string().split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };

        let key = key.trim();
        let Ok(value) = value.trim().parse::<usize>() else {
            continue;
        };

        if BUILDER_OPTIONS.contains(&key) {
            builder.push_str(&format!(".{key}({value})"));
        }
    }

    builder.push_str(".build()");
    builder
}

/// Rewrites an `async fn name(handle: Handle, ...) { body }` item into a
/// synchronous `fn name() { ... }` that builds an event loop, binds every
/// parameter to a handle of that loop and runs the body to completion.
pub(crate) fn rewrite(attr: TokenStream, item: TokenStream, what: &str) -> Vec<TokenTree> {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    if let Some(pos) = tokens
        .iter()
        .position(|t| matches!(t, TokenTree::Ident(id) if id.to_string() == "async"))
    {
        tokens.remove(pos);
    }

    let Some(body_pos) = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))
    else {
        return Vec::new();
    };

    let mut bindings = String::new();

    if let Some(params_pos) = tokens
        .iter()
        .position(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Parenthesis))
    {
        if let TokenTree::Group(g) = &tokens[params_pos] {
            for param in split_args(g.stream()) {
                bindings.push_str(&format!(
                    "let {} = __event_loop.handle();\n",
                    tokens_to_string(&param)
                ));
            }
        }

        tokens[params_pos] = TokenTree::Group(Group::new(Delimiter::Parenthesis, TokenStream::new()));
    }

    let body = match &tokens[body_pos] {
        TokenTree::Group(g) => g.stream().to_string(),
        _ => unreachable!(),
    };

    let new_body = format!(
        "{{
            let __event_loop = {builder}.expect(\"failed to build the event loop\");
            {bindings}
            __event_loop
                .run_until_complete(async move {{ {body} }})
                .expect(\"event loop stopped before {what} completed\")
        }}",
        builder = builder_expr(attr),
    );

    let Ok(new_body) = new_body.parse::<TokenStream>() else {
        return "compile_error!(\"tulip: could not rewrite the function body\");"
            .parse::<TokenStream>()
            .map(|ts| ts.into_iter().collect())
            .unwrap_or_default();
    };

    tokens[body_pos] = TokenTree::Group(Group::new(Delimiter::Brace, new_body));
    tokens
}
