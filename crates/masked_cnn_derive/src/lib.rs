use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod parametric;

/// Implements `Parametric` for a layer by forwarding to its field marked `#[parametric]`.
///
/// Inside the runtime crate itself, add `#[parametric(crate = "crate")]` on the struct.
#[proc_macro_derive(Parametric, attributes(parametric))]
pub fn derive_parametric(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    parametric::derive_parametric(input).into()
}
