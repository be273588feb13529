//! Raw FFI bindings for the Hamamatsu `specu1b` mini-spectrometer driver.
//!
//! The bindings are generated by `build.rs` from the `specu1b.h` header
//! shipped with the TokuSpec software when the `tokuspec-sdk` feature is
//! enabled. Without the feature this crate is an empty shell so dependent
//! crates can still build on machines without the driver installed.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
