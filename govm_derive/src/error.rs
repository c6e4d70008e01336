//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations,
//! plus a `variant_name()` accessor on enums.
//!
//! # Usage
//!
//! ```ignore
//! use govm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum VMError {
//!     #[error("allocation limit exceeded: {allocated} > {limit}")]
//!     AllocationLimitExceeded { allocated: i64, limit: i64 },
//!
//!     #[error("{0} is not yet implemented")]
//!     NotImplemented(&'static str),
//!
//!     #[error("unexpected op")]
//!     UnexpectedOp,
//! }
//! ```
//!
//! Only the fields a message mentions are bound, so a variant may carry
//! context that is not rendered without tripping unused-argument errors.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (display_body, inherent) = match &input.data {
        Data::Enum(data) => {
            let mut arms = Vec::with_capacity(data.variants.len());
            let mut labels = Vec::with_capacity(data.variants.len());
            for variant in &data.variants {
                let ident = &variant.ident;
                let message = message(&variant.attrs, ident, "variant")?;
                let (pattern, format) = bind_fields(&variant.fields, &message);
                arms.push(quote! { Self::#ident #pattern => write!(f, #format), });
                let label = ident.to_string();
                labels.push(quote! { Self::#ident { .. } => #label, });
            }
            let body = quote! {
                match self {
                    #(#arms)*
                }
            };
            let inherent = quote! {
                impl #impl_generics #name #ty_generics #where_clause {
                    /// Returns the name of the variant, without its payload.
                    pub fn variant_name(&self) -> &'static str {
                        match self {
                            #(#labels)*
                        }
                    }
                }
            };
            (body, inherent)
        }
        Data::Struct(data) => {
            let message = message(&input.attrs, name, "type")?;
            let (pattern, format) = bind_fields(&data.fields, &message);
            let body = quote! {
                let Self #pattern = self;
                write!(f, #format)
            };
            (body, TokenStream2::new())
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}

        #inherent
    })
}

/// Reads the `#[error("...")]` message attached to a variant or type.
fn message<T: ToTokens>(attrs: &[Attribute], target: &T, what: &str) -> syn::Result<LitStr> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!(
                "missing #[error(\"...\")] on {what} `{}`; every error must declare a display message",
                target.to_token_stream()
            ),
        ));
    };
    attr.parse_args::<LitStr>().map_err(|_| {
        syn::Error::new_spanned(
            &attr.meta,
            "expected a string literal, e.g. #[error(\"out of gas: {used} > {limit}\")]",
        )
    })
}

/// Builds the destructuring pattern for `fields` and the format literal that
/// refers to the bound names. Positional `{0}` placeholders become `{f0}`.
fn bind_fields(fields: &Fields, message: &LitStr) -> (TokenStream2, LitStr) {
    let text = message.value();
    match fields {
        Fields::Unit => (TokenStream2::new(), message.clone()),
        Fields::Named(named) => {
            let used: Vec<_> = named
                .named
                .iter()
                .filter_map(|f| f.ident.as_ref())
                .filter(|ident| mentions(&text, &ident.to_string()))
                .collect();
            (quote! { { #(#used,)* .. } }, message.clone())
        }
        Fields::Unnamed(unnamed) => {
            let mut rewritten = text.clone();
            let mut slots = Vec::with_capacity(unnamed.unnamed.len());
            for i in 0..unnamed.unnamed.len() {
                let key = i.to_string();
                if mentions(&text, &key) {
                    let ident = format_ident!("f{}", i);
                    rewritten = rewritten
                        .replace(&format!("{{{key}}}"), &format!("{{{ident}}}"))
                        .replace(&format!("{{{key}:"), &format!("{{{ident}:"));
                    slots.push(quote! { #ident });
                } else {
                    slots.push(quote! { _ });
                }
            }
            (
                quote! { ( #(#slots),* ) },
                LitStr::new(&rewritten, message.span()),
            )
        }
    }
}

/// Whether `text` interpolates `key`, either bare or with a format spec.
fn mentions(text: &str, key: &str) -> bool {
    text.contains(&format!("{{{key}}}")) || text.contains(&format!("{{{key}:"))
}
