//! # cachepilot-id
//!
//! Resource identity for cachepilot.
//!
//! Every runtime custom resource is addressed by a `(namespace, name)` pair.
//! The pair is stable for the lifetime of the resource and is used as:
//!
//! - the engine registry key,
//! - the work queue item,
//! - the holder recorded against allocated ports.
//!
//! ## Format
//!
//! The canonical string form is `{namespace}/{name}`:
//!
//! - `default/imagenet`
//! - `fluid-system/alluxio-cache`
//!
//! Both halves must be valid Kubernetes object names (DNS-1123 subdomains).

mod error;
mod key;

pub use error::IdError;
pub use key::ResourceKey;
