//! Integration tests for the AzureCluster controller on a live API server
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about reading and writing AzureCluster records
//!   through the kube-backed State Accessor
//!
//! - `reconcile_live`: Stories about full reconcile passes with records stored
//!   in the API server and cloud resources held in memory
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod crd_operations;
mod helpers;
mod reconcile_live;
