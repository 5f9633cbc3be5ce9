//! Zero-copy multi-ring capture and fan-out core for an FPGA telemetry
//! stream.
//!
//! A [`coordinator::Coordinator`] owns the kernel-bypass NIC's receive rings
//! and a set of worker tasks, each running its own cooperative event loop on
//! its own thread (see [`runtime`]). The coordinator's job is purely to
//! compute, per ring, how far every active task has progressed and release
//! slots no task still needs (see [`ring`] and [`dispatch`]); it never looks
//! at frame contents itself.
//!
//! Two tasks ship with this crate: [`tasks::writer`] saves a requested
//! window of ticks to disk, and [`tasks::histogram`] reassembles and
//! publishes MCA histograms to TCP subscribers. Both are built on the same
//! [`runtime::Task`] / [`dispatch::PacketHandler`] seam, so a consumer of
//! this crate can add others the same way.
//!
//! This crate does not know how to talk to real kernel-bypass hardware: the
//! [`nic::Nic`] trait is the seam a vendor NIC wrapper plugs into, and the
//! binary that links this crate is expected to provide one (and to install a
//! `log` subscriber such as `env_logger`).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod aio;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod nic;
pub mod ring;
pub mod runtime;
pub mod seq;
pub mod signal;
pub mod stats;
pub mod task;
pub mod tasks;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
