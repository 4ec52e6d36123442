//! Owned wrappers over librdmacm and libibverbs.
//!
//! Everything here is compiled only with the `verbs` feature, which also makes the build script
//! generate the bindings and link the system libraries.
#![cfg(feature = "verbs")]

pub mod ffi;
pub mod ibv;
pub mod mr;
pub mod rdmacm;
