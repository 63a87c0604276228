//! Raw FFI bindings to llama.cpp, generated by `bindgen` at build time.
//!
//! Covers the `llama_*` C API plus the `ggml_backend_*` registry functions
//! used to load optional compute backends on demand.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
