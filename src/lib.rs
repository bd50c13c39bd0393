//! Turnstile - HTTP Admission Control
//!
//! This crate implements a rate limiting gateway that sits in front of an
//! HTTP application. Each request is mapped to an identity (the client
//! address or an API token) and admitted against a fixed-window budget with a
//! block period, kept in a shared key-value store so that several gateway
//! processes enforce one limit.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
