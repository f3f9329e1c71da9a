//! # Message Repository
//!
//! Repository implementation for Message entities: the coordinator's bulk
//! commit, the recent-messages read path, and the administrative truncate.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};

use crate::models::message::{ActiveModel as MessageActiveModel, Column, Entity as Message, Model};
use crate::records::QueuedMessage;

/// Repository for Message database operations
pub struct MessageRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> MessageRepository<'a> {
    /// Create a new MessageRepository with the given database connection
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Commits a whole batch in a single transaction.
    ///
    /// `id` is assigned by the store; `inserted_at` carries the commit
    /// instant; every other field comes from the staged record.
    pub async fn insert_batch(&self, batch: &[QueuedMessage]) -> Result<(), DbErr> {
        if batch.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        let committed_at = to_db_time(Utc::now());

        let models = batch.iter().map(|message| MessageActiveModel {
            user_id: Set(message.user_id),
            channel_id: Set(message.channel_id),
            content: Set(message.content.clone()),
            created_at: Set(to_db_time(message.created_at)),
            inserted_at: Set(committed_at),
            ..Default::default()
        });

        Message::insert_many(models).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    /// The last `limit` persisted rows, newest commit first.
    pub async fn recent(&self, limit: u64) -> Result<Vec<Model>, DbErr> {
        Message::find()
            .order_by_desc(Column::InsertedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(self.db)
            .await
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        Message::find().count(self.db).await
    }

    /// Truncates the table, returning the number of deleted rows.
    pub async fn delete_all(&self) -> Result<u64, DbErr> {
        let result = Message::delete_many().exec(self.db).await?;
        Ok(result.rows_affected)
    }
}

/// Converts an ingest timestamp to the store's timezone-carrying type.
pub fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    DateTime::from_naive_utc_and_offset(
        dt.naive_utc(),
        FixedOffset::east_opt(0).expect("UTC offset"),
    )
}
