//! Asynchronous media analysis pipeline
//!
//! Clients obtain a pre-signed URL, PUT their video or image straight to the
//! object store, confirm, and poll. Workers lease job-ready messages from a
//! work queue, run the analyzer, write a result document and advance the job
//! through a conditional-write state machine.

pub mod app_state;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
