//! vmleased: lifecycle orchestration for short-lived leased VMs.
//!
//! The crate splits into an unprivileged side (record store, pool
//! allocation, lifecycle orchestration, the `vmleased` CLI) and a privileged
//! side (the `vmleased-rootd` agent, which validates and executes the small
//! set of virsh/qemu-img actions the lifecycle needs). The two talk over a
//! length-prefixed JSON frame protocol on a Unix socket; see [`agent`].

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod vm;
