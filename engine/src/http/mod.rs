//! Backend HTTP access

pub mod client;
