//! Message entity model
//!
//! This module contains the SeaORM entity model for the messages table,
//! which stores batch-committed chat messages.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Message entity representing a persisted chat message
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    /// Store-assigned monotonically increasing identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Identifier of the authoring user
    pub user_id: i32,

    /// Identifier of the channel the message was posted to
    pub channel_id: i32,

    /// Message body
    #[sea_orm(column_type = "Text")]
    pub content: String,

    /// Timestamp assigned at ingest
    pub created_at: DateTimeWithTimeZone,

    /// Store-assigned commit instant
    pub inserted_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
