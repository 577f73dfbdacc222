//! Pieces of the Apache Kafka protocol the metadata cache needs to interpret.
//!
//! Encoding and decoding of metadata messages is the job of the transport
//! behind [`BrokerQueryClient`](crate::connection::BrokerQueryClient); only the
//! error codes carried in a decoded response are modelled here.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_error_codes>
pub mod error;
