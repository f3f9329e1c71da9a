//! # Repositories
//!
//! Data access layer over the relational store.

pub mod message;

pub use message::MessageRepository;
