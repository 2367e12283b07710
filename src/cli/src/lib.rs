//! A3S Bake CLI library.
//!
//! Exposes the command definitions so integration tests and embedders can
//! drive the same code paths as the `a3s-bake` binary.

pub mod commands;
pub mod output;
