//! HTTP layer for the wellbeing API proxy.
//!
//! This module provides the axum-based server that validates inbound
//! requests, forwards them to the upstream API with bounded retries, and
//! wraps every response with correlation headers and cache policy.

pub mod cache_control;
pub mod envelope;
pub mod handler;
pub mod validate;
