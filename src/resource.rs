//! Resource branch contract.
//!
//! This module defines what the coordinator consumes from the outside world:
//! - The XA-style branch protocol every resource manager implements
//! - The vote and error vocabulary branches answer with
//! - Descriptors that identify a resource inside a persisted archive
//! - The registry used to find live resources again after a restart

pub mod descriptor;
pub mod registry;
pub mod xa;

pub use descriptor::{ResourceDescriptor, ResourceKind};
pub use registry::ResourceRegistry;
pub use xa::{Vote, XaError, XaErrorKind, XaFlags, XaResource, XaResult};
