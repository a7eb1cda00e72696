//! Swift Upload Proxy - resumable chunked uploads into OpenStack Swift
//!
//! Clients send a file as independently transferred, possibly out-of-order
//! and retried chunks. Uploads of 5 GiB and more are stored as Swift
//! segments plus a manifest; smaller ones are reassembled in order and
//! written with a single PUT.

pub mod api;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod storage;
pub mod types;
pub mod upload;
