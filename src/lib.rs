//! Straylight — a Signal messenger bot gateway.
//!
//! Drivers normalise D-Bus, JSON-RPC, or console transports into one
//! inbound stream; the dispatcher routes command lines to modules under a
//! two-level access-control tree; the perioder re-injects scheduled virtual
//! messages; the differ gives modules a "what changed" reply mode.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod act;
pub mod attachment;
pub mod cmdsplit;
pub mod config;
pub mod differ;
pub mod dispatcher;
pub mod driver;
pub mod logging;
pub mod message;
pub mod module;
pub mod perioder;
