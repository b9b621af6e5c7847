//! tsrproxy - a TLS-terminating reverse proxy for a single backend
//!
//! This library exposes one backend HTTP origin to clients on a private
//! overlay network:
//! - Terminates TLS with certificates looked up per server name on demand
//! - Forwards every request to the configured backend, preserving path and
//!   query and rewriting the `Host` header
//! - Streams backend responses back without buffering
//! - Answers backend failures with an escaped HTML 502 page

pub mod certs;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod listener;
pub mod proxy;
pub mod tls;
