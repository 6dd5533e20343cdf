//! JSON `$ref` resolver for Context batch payloads.
//!
//! NOTE: The implementation for this crate (notably `resolve_batch_refs`,
//! referenced by `crates/mcp-server`) was not present in the authored sources
//! and could not be reconstructed mechanically. This file exists only to give
//! the crate a valid library target so the rest of the workspace can be built
//! and tested.
