//! Database module

mod schema;
mod write_buffer;

pub use write_buffer::{
    IngestSnapshot, PersistenceSink, SubmitError, WriteBuffer, WriteBufferConfig, WriteSender,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::str::FromStr;

use crate::config::DatabaseConfig;

/// Rows per INSERT statement when committing a batch, kept under SQLite's bind limit
const INSERT_CHUNK_ROWS: usize = 250;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A post accepted for ingestion but not yet persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub user_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl NewPost {
    pub fn new(user_id: i64, text: String) -> Self {
        Self {
            user_id,
            text,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

type PostRow = (i64, i64, String, i64);

impl From<PostRow> for Post {
    fn from((id, user_id, text, created_at): PostRow) -> Self {
        Self {
            id,
            user_id,
            text,
            created_at: from_millis(created_at),
        }
    }
}

fn from_millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now)
}

/// True when the error came from a UNIQUE or PRIMARY KEY constraint
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database. The connection is never recycled,
    /// since closing it would discard the data.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // WAL lets timeline reads proceed while a batch commits
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for statement in [
            schema::CREATE_USERS_TABLE,
            schema::CREATE_CREDENTIALS_TABLE,
            schema::CREATE_FOLLOWS_TABLE,
            schema::CREATE_POSTS_TABLE,
            schema::CREATE_INDEX_POSTS_USER_CREATED,
            schema::CREATE_INDEX_FOLLOWS_FOLLOWED,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create a user and its credentials atomically
    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query("INSERT INTO users (username, created_at) VALUES (?, ?)")
            .bind(username)
            .bind(created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        sqlx::query("INSERT INTO credentials (user_id, password_hash) VALUES (?, ?)")
            .bind(id)
            .bind(password_hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(User {
            id,
            username: username.to_string(),
            created_at: from_millis(created_at.timestamp_millis()),
        })
    }

    /// Look up a user's id and stored password hash by username
    pub async fn get_credentials(&self, username: &str) -> Result<Option<(i64, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT u.id, c.password_hash
            FROM users u
            JOIN credentials c ON c.user_id = u.id
            WHERE u.username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn user_exists(&self, user_id: i64) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 != 0)
    }

    /// Fails with a unique violation if the follow already exists
    pub async fn insert_follow(&self, follower_id: i64, followed_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO follows (follower_id, followed_id, created_at) VALUES (?, ?, ?)")
            .bind(follower_id)
            .bind(followed_id)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns false if there was no such follow
    pub async fn delete_follow(&self, follower_id: i64, followed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM follows WHERE follower_id = ? AND followed_id = ?")
            .bind(follower_id)
            .bind(followed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_post(&self, post_id: i64) -> Result<Option<Post>> {
        let row: Option<PostRow> =
            sqlx::query_as("SELECT id, user_id, text, created_at FROM posts WHERE id = ?")
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Post::from))
    }

    /// Posts by everyone `user_id` follows, newest first
    pub async fn get_timeline(&self, user_id: i64, limit: i64) -> Result<Vec<Post>> {
        let rows: Vec<PostRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.user_id, p.text, p.created_at
            FROM posts p
            JOIN follows f ON f.followed_id = p.user_id
            WHERE f.follower_id = ?
            ORDER BY p.created_at DESC, p.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Post::from).collect())
    }

    /// Insert many posts in a single transaction, preserving slice order in row ids
    pub async fn batch_insert_posts(&self, posts: &[NewPost]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in posts.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO posts (user_id, text, created_at) ");
            builder.push_values(chunk, |mut row, post| {
                row.push_bind(post.user_id)
                    .push_bind(post.text.as_str())
                    .push_bind(post.created_at.timestamp_millis());
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl PersistenceSink<NewPost> for Database {
    async fn commit_batch(&self, items: &[NewPost]) -> Result<()> {
        self.batch_insert_posts(items).await
    }
}
