//! Hardware adapters wrapping the vendor SDKs.

pub mod dcam;
pub mod minispectro;
