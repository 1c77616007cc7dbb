//! Langbase Pipes client and wire types.
//!
//! Every collaborator in the research pipeline is backed by one pipe. The client
//! owns the transport retry budget; schema validation of completions lives in
//! [`crate::agents`].

mod client;
mod types;


pub use client::LangbaseClient;
pub use types::*;
