use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, parse_macro_input};

/// Exports a function as a C symbol that shadows the libc one.
///
/// This attribute macro:
/// 1. Adds `#[unsafe(no_mangle)]` and `extern "C"`, keeping the name
/// 2. Registers the symbol in `crate::symbols::INTERPOSED`
///
/// # Example
///
/// ```ignore
/// #[interpose]
/// pub unsafe fn send(fd: libc::c_int, buf: *const libc::c_void, len: usize, flags: libc::c_int) -> isize {
///     // implementation
/// }
/// ```
///
/// Expands to:
///
/// ```ignore
/// #[unsafe(no_mangle)]
/// pub unsafe extern "C" fn send(fd: libc::c_int, buf: *const libc::c_void, len: usize, flags: libc::c_int) -> isize {
///     // implementation
/// }
///
/// #[linkme::distributed_slice(crate::symbols::INTERPOSED)]
/// static _ZCOPY_SYM_SEND: (&str, crate::symbols::FnPtr) = ("send", crate::symbols::FnPtr(send as *const ()));
/// ```
#[proc_macro_attribute]
pub fn interpose(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let attrs = &input.attrs;

    let name = &sig.ident;
    let unsafety = &sig.unsafety;
    let symbol_name = name.to_string();
    let static_name = format_ident!("_ZCOPY_SYM_{}", symbol_name.to_uppercase());

    let inputs = &sig.inputs;
    let output = &sig.output;

    let expanded = quote! {
        #(#attrs)*
        #[unsafe(no_mangle)]
        #vis #unsafety extern "C" fn #name(#inputs) #output #block

        #[linkme::distributed_slice(crate::symbols::INTERPOSED)]
        static #static_name: (&str, crate::symbols::FnPtr) =
            (#symbol_name, crate::symbols::FnPtr(#name as *const ()));
    };

    TokenStream::from(expanded)
}
