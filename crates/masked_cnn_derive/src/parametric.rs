use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, Ident, LitStr, Path, Result, spanned::Spanned};

pub fn derive_parametric(input: DeriveInput) -> TokenStream {
    expand(&input).unwrap_or_else(Error::into_compile_error)
}

fn expand(input: &DeriveInput) -> Result<TokenStream> {
    let field = params_field(input)?;
    let base = crate_path(input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let tensor = quote!(#base::loom::tensor::Tensor<f32>);
    let parametric = quote!(#base::graph::Parametric);
    Ok(quote! {
        impl #impl_generics #parametric for #name #ty_generics #where_clause {
            #[inline]
            fn weights(&self) -> &#tensor {
                #parametric::weights(&self.#field)
            }

            #[inline]
            fn biases(&self) -> &#tensor {
                #parametric::biases(&self.#field)
            }

            #[inline]
            fn activation(&self) -> #base::hal::activation::Activation {
                #parametric::activation(&self.#field)
            }
        }
    })
}

/// The one named field marked `#[parametric]`.
fn params_field(input: &DeriveInput) -> Result<&Ident> {
    let Data::Struct(data) = &input.data else {
        return Err(Error::new(input.span(), "layers deriving `Parametric` must be structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(Error::new(data.fields.span(), "expected named fields"));
    };

    let mut marked = fields
        .named
        .iter()
        .filter(|field| field.attrs.iter().any(|attr| attr.path().is_ident("parametric")));
    let field = match (marked.next(), marked.next()) {
        (Some(field), None) => field,
        (None, _) => {
            return Err(Error::new(fields.span(), "mark the parameters with #[parametric]"));
        }
        (Some(_), Some(extra)) => {
            return Err(Error::new(extra.span(), "only one field may be #[parametric]"));
        }
    };
    field
        .ident
        .as_ref()
        .ok_or_else(|| Error::new(field.span(), "expected a named field"))
}

/// Path of the runtime crate, `::masked_cnn` unless overridden by `#[parametric(crate = "...")]`.
fn crate_path(input: &DeriveInput) -> Result<Path> {
    let mut path: Path = syn::parse_quote!(::masked_cnn);
    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("parametric")) {
        attr.parse_nested_meta(|meta| match meta.path.is_ident("crate") {
            true => {
                path = meta.value()?.parse::<LitStr>()?.parse()?;
                Ok(())
            }
            false => Err(meta.error("expected `crate = \"...\"`")),
        })?;
    }
    Ok(path)
}
