//! Provisions model weights for an image-generation pipeline.
//!
//! A [`weights::Manifest`] maps weight identifiers to download locations.
//! [`weights::Provisioner`] walks a list of requested identifiers (or the
//! references found in a [`workflow::WorkflowGraph`]), skips artifacts that
//! already exist on disk and fetches the rest, one at a time.

pub mod core;
pub mod error;
pub mod weights;
pub mod workflow;

pub use error::{ProvisionError, Result};
