mod utils;

use proc_macro::{TokenStream, TokenTree};

/// Runs an `async fn main` on a fresh event loop.
///
/// Parameters, if any, are bound to handles of that loop:
///
/// ```rust,ignore
/// #[tulip::main(read_buffer_size = 16384)]
/// async fn main(handle: tulip::Handle) {
///     handle.sleep(Duration::from_millis(10)).await.unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    utils::rewrite(attr, item, "main").into_iter().collect()
}

/// Turns an `async fn` into a `#[test]` running on a fresh event loop.
///
/// Accepts the same parameters and options as [`macro@main`].
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let tokens = utils::rewrite(attr, item, "the test");

    let test_attr: TokenStream = "#[test]".parse().unwrap_or_default();
    let mut result: Vec<TokenTree> = test_attr.into_iter().collect();
    result.extend(tokens);

    result.into_iter().collect()
}
