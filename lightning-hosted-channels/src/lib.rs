// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_hosted_channels"]

//! A hosted-channels plugin library for a Lightning node.
//!
//! A hosted channel is a trust-based, off-chain, two-party balance agreement between a *host* and
//! a *client*: no funding transaction exists on chain, and the only security mechanism is a pair
//! of cross-signed state attestations (the [`LastCrossSignedState`]) which either party can
//! publish as evidence of misbehavior. This crate lets a node act as host (and client) for many
//! peers at once, routing ordinary Lightning HTLCs in and out of hosted balances.
//!
//! The crate is a library much like the host node is expected to be: it contains no networking or
//! RPC of its own beyond the thin tokio driver in [`plugin`], and talks to the underlying node
//! exclusively through the [`chain::NodeInterface`] trait. See [`hosted::channelmaster`] for the
//! top-level object.
//!
//! [`LastCrossSignedState`]: hosted::msgs::LastCrossSignedState

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

extern crate bitcoin;

#[macro_use]
pub mod util;
pub mod chain;
pub mod hosted;
pub mod control;
pub mod plugin;
