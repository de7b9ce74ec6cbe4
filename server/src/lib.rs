//! Merathon Server - Backend for a marathon event management site.
//!
//! This crate provides:
//! - Event CRUD with per-creator listings
//! - Registrations that keep a per-event counter
//! - Cookie-carried session tokens and an ownership check for protected routes
//! - A chat relay that answers questions with recent events as context
//!
//! # Architecture
//!
//! Route handlers in [`routes`] share an [`AppState`](routes::AppState)
//! holding a [`Store`](store::Store) handle created once at startup. MongoDB
//! is the production backend; an in-memory store serves tests and local
//! development.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod registrations;
pub mod routes;
pub mod store;
