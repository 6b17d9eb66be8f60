//! Settings, on-disk layout and the persistence interface

pub mod layout;
pub mod settings;
pub mod store;
