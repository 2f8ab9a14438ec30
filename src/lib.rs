//! A pure Rust decoder for the AllJoyn wire protocols, suitable for building
//! packet-analysis tools.
//!
//! The crate describes bytes; it never sends, receives, or authenticates.
//! Each call to one of the dissector entry points in [`protocol`] is a single
//! synchronous pass over one captured buffer, producing a labeled node tree
//! through a caller-supplied [`protocol::NodeEmitter`] and a one-line summary
//! in a [`protocol::InfoColumn`].

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

pub mod protocol;
