#![doc = include_str!("../README.md")]

#[cfg(not(target_os = "linux"))]
compile_error!("storaged only supports Linux");

//re-export zbus
pub use zbus;

pub mod block;
pub mod bus;
pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod device;
mod error;
pub(crate) mod gettext;
pub mod job;
pub mod r#loop;
pub mod mdraid;
pub mod mounts;
pub mod poller;
pub mod polkit;
pub mod store;

pub use config::Config;
pub use daemon::{standard_options, Collaborators, Daemon, Invocation, Options};
pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod testkit;

#[cfg(test)]
mod cleanup_tests;
