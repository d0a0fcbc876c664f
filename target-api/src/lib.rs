//! Client for the iscsi-target-api management service.
//!
//! The service owns volume, target and LUN lifecycle on the storage host.
//! This crate provides the request objects it accepts and an HTTP client
//! implementing the [`TargetApi`] trait.
//!
//! ```ignore
//! use target_api::{HttpClient, ServerCfg, TargetApi, TargetCfg};
//!
//! let client = HttpClient::new(ServerCfg::default())?;
//! client.delete_target(&TargetCfg::new("iqn.2024-01.k8s.ns:pvc1")).await?;
//! ```

mod client;
mod protocol;

pub use client::{HttpClient, Operation, ServerCfg, TargetApi};
pub use protocol::*;
