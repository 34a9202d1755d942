//! `contacts-core`: contact domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Contact`/`State` records and their validation rules.

pub mod contact;
pub mod entity;
pub mod error;
pub mod id;

pub use contact::{Contact, ContactDetails, State};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ContactId, MessageId, StateId};
