//! Raw FFI bindings for the Hamamatsu DCAM-API camera SDK.
//!
//! The bindings are generated by `build.rs` from the `dcamapi4.h` /
//! `dcamprop.h` headers when the `dcam-sdk` feature is enabled. Without the
//! feature this crate is an empty shell so dependent crates can still build
//! on machines without the SDK installed.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
