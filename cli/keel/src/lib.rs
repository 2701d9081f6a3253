//! keel - installer for single-node keel deployments.
//!
//! The binary drives k3d, helm and docker; the flows in [`flow`] are
//! written against the collaborator traits so they can run against the
//! mocks in [`mock`].

pub mod charts;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod logging;
pub mod mock;
pub mod output;
pub mod live;
pub mod prompt;
pub mod source;
pub mod tool;

pub use error::KeelError;
