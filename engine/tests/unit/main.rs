//! Integration tests

mod common;
mod test_deploy;
mod test_fsm;
mod test_http;
mod test_jobs;
mod test_probe;
mod test_relay;
