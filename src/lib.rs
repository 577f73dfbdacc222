//! Topology metadata cache for Apache Kafka clients.
//!
//! The [`Client`](client::Client) keeps brokers, topics and partition leaders
//! cached, refreshes them on demand or when they get old, and coalesces
//! concurrent refreshes so the cluster sees a single query per scope. Talking
//! to the cluster is left to a [`BrokerQueryClient`](connection::BrokerQueryClient).
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rust_2018_idioms,
    unsafe_code
)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
mod backoff;
pub mod client;
pub mod connection;
pub mod metadata;
mod protocol;
pub mod topic;

pub use backoff::BackoffConfig;

pub type ProtocolError = protocol::error::ErrorCode;
