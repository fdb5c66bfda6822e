#![doc(issue_tracker_base_url = "https://github.com/flowem/flowem/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Distributed per-flow network condition emulation.
//!
//! Link declarations live in a central directory. Every node runs a [`daemon::Context`] that
//! keeps its shaping table in step with the directory and enforces it on the frames leaving
//! its interfaces.

pub use flowem_common as common;
pub use flowem_shaper as shaper;
pub use flowem_sync as sync;
pub use flowem_wire::*;

pub mod config;
pub mod daemon;
pub mod owner;
