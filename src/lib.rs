//! Chatgate - admission-controlled chat gateway
//!
//! This crate implements a small gateway that forwards chat requests to a
//! hosted model API. Every request first passes through a single shared
//! admission coordinator that enforces sliding-window limits per source
//! address and per credential, so the externally billed upstream call is
//! only made for admitted requests.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod ratelimit;
