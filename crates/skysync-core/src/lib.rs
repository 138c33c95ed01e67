//! SkySync Core - Domain model and ports
//!
//! Provides:
//! - Validated domain newtypes and the sync configuration wire format
//! - Content fingerprints and filename canonicalization
//! - The LocalNode shadow tree and the mirrored cloud tree
//! - Port traits for the cloud client, transfer pipeline, filesystem,
//!   config store, and application observer

pub mod config;
pub mod domain;
pub mod ports;
