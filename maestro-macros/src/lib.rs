use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::{parse_macro_input, punctuated::Punctuated, ItemFn, Lit, Meta, Token};

/// Reads a `key = "string"` attribute argument
fn string_arg(args: &Punctuated<Meta, Token![,]>, key: &str) -> Option<String> {
    args.iter().find_map(|meta| {
        if let Meta::NameValue(nv) = meta {
            if nv.path.is_ident(key) {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        return Some(lit.value());
                    }
                }
                abort!(nv.value, "Expected a string literal for {}", key);
            }
        }
        None
    })
}

/// Turns an `async fn(Value, &HandlerContext) -> anyhow::Result<Value>` into a
/// `TaskHandler` and registers it for `HandlerRegistry::with_registered`.
///
/// ```ignore
/// #[task_handler(
///     name = "system_design",
///     description = "Drafts the solution layout",
///     input_schema = r#"{"type": "object", "required": ["requirements"]}"#
/// )]
/// async fn system_design(input: Value, ctx: &HandlerContext) -> anyhow::Result<Value> {
///     Ok(json!({"design": input["requirements"]}))
/// }
/// ```
#[proc_macro_attribute]
#[proc_macro_error]
pub fn task_handler(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse task_handler attributes: {}", e));

    for meta in &attr_args {
        let known = ["name", "description", "input_schema"]
            .iter()
            .any(|key| meta.path().is_ident(key));
        if !known {
            abort!(
                meta.path(),
                "Unknown task_handler attribute; expected name, description or input_schema"
            );
        }
    }

    let name = string_arg(&attr_args, "name").unwrap_or_else(|| {
        abort!(
            proc_macro2::Span::call_site(),
            "task_handler requires a name attribute"
        )
    });
    let description =
        string_arg(&attr_args, "description").unwrap_or_else(|| format!("Task handler for {}", name));
    let input_schema = string_arg(&attr_args, "input_schema");

    // Validate the schema at compile time
    if let Some(schema) = &input_schema {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(schema) {
            abort!(input_fn.sig, "Invalid input_schema JSON: {}", e);
        }
    }

    if input_fn.sig.asyncness.is_none() {
        abort!(input_fn.sig.fn_token, "task_handler functions must be async");
    }
    if input_fn.sig.inputs.len() != 2 {
        abort!(
            input_fn.sig.inputs,
            "task_handler functions take (input: Value, ctx: &HandlerContext)"
        );
    }

    let fn_name = &input_fn.sig.ident;
    let fn_vis = &input_fn.vis;
    let struct_name = format_ident!("__{}Handler", fn_name);
    let ctor_name = format_ident!("__{}_handler_new", fn_name);
    let static_name = format_ident!("__{}_HANDLER_REGISTRATION", fn_name.to_string().to_uppercase());

    let schema_body = match &input_schema {
        Some(schema) => quote! { ::maestro::serde_json::from_str(#schema).ok() },
        None => quote! { None },
    };

    let expanded = quote! {
        #input_fn

        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, Default)]
        #fn_vis struct #struct_name;

        #[::maestro::async_trait::async_trait]
        impl ::maestro::TaskHandler for #struct_name {
            fn name(&self) -> String {
                #name.to_string()
            }

            fn description(&self) -> String {
                #description.to_string()
            }

            fn input_schema(&self) -> Option<::maestro::serde_json::Value> {
                #schema_body
            }

            async fn execute(
                &self,
                input: ::maestro::serde_json::Value,
                ctx: &::maestro::HandlerContext,
            ) -> ::maestro::anyhow::Result<::maestro::serde_json::Value> {
                #fn_name(input, ctx).await
            }
        }

        #[allow(non_snake_case)]
        fn #ctor_name() -> ::std::sync::Arc<dyn ::maestro::TaskHandler> {
            ::std::sync::Arc::new(#struct_name)
        }

        #[::maestro::linkme::distributed_slice(::maestro::TASK_HANDLERS)]
        #[linkme(crate = ::maestro::linkme)]
        #[allow(non_upper_case_globals)]
        static #static_name: fn() -> ::std::sync::Arc<dyn ::maestro::TaskHandler> = #ctor_name;
    };

    expanded.into()
}
