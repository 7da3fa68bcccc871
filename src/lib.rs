//! Operator API Proxy
//!
//! A reverse proxy between an automation engine acting for a custom resource
//! and the Kubernetes API. It classifies each request the way the API server
//! routes it, answers cacheable reads locally, injects the acting owner into
//! created resources and watches those dependents so changes re-trigger the
//! owner.

pub mod cache;
pub mod controllermap;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod owner;
pub mod proxy;
pub mod requestinfo;
pub mod watches;

pub use error::{Error, Result};
