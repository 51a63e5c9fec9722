// WireGuard safe-deployment library
// Shared modules for the CLI and integration tests

//! Safe deployment of WireGuard server configuration
//!
//! This library renders a WireGuard interface config and its companion
//! iptables script from a domain snapshot, deploys them with the least
//! disruptive strategy, and can wrap a deployment in a commit-confirm
//! transaction that reverts automatically unless confirmed.
//!
//! # Main Components
//!
//! - [`ip_alloc`]: Tunnel octet allocation and address validation
//! - [`render`]: Interface config and client peer file rendering
//! - [`firewall`]: Typed iptables plan and firewall script rendering
//! - [`executor`]: Host activation (firewall, hot reload, full restart)
//! - [`orchestrator`]: Diff-driven commit pipeline
//! - [`state`]: Commit-confirm transaction guard
//! - [`store`]: Domain persistence seam and last-known-good baseline
//! - [`keys`]: Key generation
//! - [`setup`]: Server keys, endpoint and setup status
//! - [`signals`]: Termination signals while a change awaits confirmation
//! - [`config`]: Configuration file parsing and validation

pub mod config;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod ip_alloc;
pub mod keys;
pub mod orchestrator;
pub mod render;
pub mod setup;
pub mod signals;
pub mod state;
pub mod state_file;
pub mod store;
pub mod tools;
pub mod types;
