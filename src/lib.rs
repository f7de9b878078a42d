//! # FPV Logdump Library
//!
//! Retrieve flight logs from a flight controller over a lossy link.
//!
//! This library provides the log catalog, the chunked download session with
//! gap re-requests, the download queue and the unattended dump workflow that
//! downloads every log, restores the device and erases its storage.

pub mod app;
pub mod catalog;
pub mod command;
pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod link;
pub mod protocol;
pub mod report;
pub mod sim;
pub mod sink;
pub mod transfer;
