//! Typed views over node payloads.
//!
//! Each submodule packs and unpacks one family of leaf payloads: fixed-width
//! integers, the three adaptive string representations, and flat ref arrays
//! used for sub-sequences and directories.

pub mod int;
pub mod refs;
pub mod string;

pub use string::StrRepr;
