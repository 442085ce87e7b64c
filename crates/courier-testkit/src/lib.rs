//! # Courier Testkit
//!
//! Testing utilities for Courier.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Schemas**: A small invoicing model with aggregates, collections, a
//!   natural key and a class that is never replicated
//! - **Fixtures**: Meshes of in-memory nodes sharing one transport folder
//! - **Generators**: Proptest strategies for edit scripts and delivery orders
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use courier_testkit::fixtures::Mesh;
//!
//! async fn example() -> courier::Result<()> {
//!     let mesh = Mesh::builder(&["A", "B"]).build().await?;
//!     let invoice = mesh.node("A").create_invoice(7, 100).await?;
//!     mesh.round().await?;
//!     assert!(mesh.node("B").invoice_by_number(7).await?.is_some());
//!     # let _ = invoice;
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use courier_testkit::generators::edit_script;
//!
//! proptest! {
//!     #[test]
//!     fn scripts_replicate(script in edit_script(8)) {
//!         // apply `script` on one node, sync, compare
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{invoice_schema, Mesh, MeshBuilder, TestNode, Topology, APP};
pub use generators::{apply_script, delivery_order, edit_script, EditOp};
