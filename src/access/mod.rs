//! Access Entries
//!
//! Single place where entry bindings change. The mutation engine calls the
//! registrar instead of touching entry bindings itself.

mod registrar;

pub use registrar::AccessEntryRegistrar;
