//! # nostr-mux Testkit
//!
//! Testing utilities for the relay multiplexer.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Generators**: Proptest strategies for filters, events and pool step sequences
//! - **Fixtures**: A recording dispatch closure and event builders
//!
//! ## Property Testing
//!
//! Drive a pool with random steps:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use nostr_mux_testkit::generators::sub_ops;
//!
//! proptest! {
//!     #[test]
//!     fn pool_converges(ops in sub_ops(40)) {
//!         // apply ops, then check every desired relay is served
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Record what a pool would put on the wire:
//!
//! ```rust
//! use std::collections::HashMap;
//! use nostr_mux_core::Filter;
//! use nostr_mux_pool::RequestPool;
//! use nostr_mux_testkit::fixtures::{relay, sub, Recorder};
//!
//! let pool = RequestPool::new();
//! let mut recorder = Recorder::new();
//! let desired = HashMap::from([(relay("a"), vec![Filter::new().kinds([1])])]);
//!
//! let affected = pool.add_or_update(&sub("feed"), desired, None);
//! pool.reconcile_relays(&sub("feed"), &affected, &mut recorder.dispatch());
//! assert_eq!(recorder.labels_for(&relay("a")), vec!["REQ"]);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{Recorder, TestFixture};
pub use generators::SubOp;
