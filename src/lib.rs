//! Hostpanel - a browser control panel for a single host
//!
//! This library provides:
//! - Container, network and volume management through the local engine
//! - Live container logs: engine log frames are demultiplexed and bridged
//!   to the browser as server-sent events
//! - nginx virtual hosts and TCP/UDP stream forwards, applied with a
//!   configuration test and rollback
//! - TLS certificates issued through certbot or generated self-signed
//! - An embedded dashboard and token-protected JSON API

pub mod api;
pub mod bridge;
pub mod certs;
pub mod config;
pub mod dashboard;
pub mod demux;
pub mod docker;
pub mod error;
pub mod logsource;
pub mod nginx;
pub mod sites;
