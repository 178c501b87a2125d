//! Post store for Pagecast
//!
//! [`PostStore`] is the narrow interface the pipeline consumes. [`Database`]
//! implements it over SQLite and adds the page and post management used by
//! the CLI and tests.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use tracing::warn;

use crate::error::{DbError, Result};
use crate::types::{ImageRef, Page, Post, PostStatus, PublishOutcome, Target, TargetState};

/// What the scheduling pipeline needs from persistence
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Scheduled posts due at or before `before` (unix seconds), oldest first,
    /// with their targets in order
    async fn list_due(&self, before: i64) -> Result<Vec<Post>>;

    /// Current stored state of one post, targets included
    async fn get_post(&self, post_id: &str) -> Result<Option<Post>>;

    /// Write back the rolled-up status. Only applies to posts that are still
    /// `scheduled`; `scheduled_at` is never touched.
    async fn update_status(&self, post_id: &str, status: PostStatus, error: Option<&str>)
        -> Result<()>;

    /// Persist the outcome of one target so later ticks skip pages that are
    /// already published
    async fn record_target(
        &self,
        post_id: &str,
        page_id: &str,
        outcome: &PublishOutcome,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Insert or update a page
    pub async fn upsert_page(&self, page: &Page) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO pages (id, name, avatar_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                avatar_url = excluded.avatar_url,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&page.id)
        .bind(&page.name)
        .bind(&page.avatar_url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT id, name, avatar_url FROM pages WHERE id = ?")
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| page_from_row(&r)))
    }

    pub async fn list_pages(&self) -> Result<Vec<Page>> {
        let rows = sqlx::query("SELECT id, name, avatar_url FROM pages ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(page_from_row).collect())
    }

    /// Remove a page and its targets. Returns whether it existed.
    pub async fn delete_page(&self, page_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM post_targets WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let result = sqlx::query("DELETE FROM pages WHERE id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Create a post with its targets. Target pages are upserted.
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let (image_url, image_blob) = match &post.image {
            Some(ImageRef::Url(url)) => (Some(url.as_str()), None),
            Some(ImageRef::Blob(bytes)) => (None, Some(bytes.as_slice())),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, content, first_comment, image_url, image_blob,
                               scheduled_at, surface_publish_at, status, error,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.content)
        .bind(&post.first_comment)
        .bind(image_url)
        .bind(image_blob)
        .bind(post.scheduled_at)
        .bind(post.surface_publish_at)
        .bind(post.status.as_str())
        .bind(&post.error)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for (position, target) in post.targets.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO pages (id, name, avatar_url, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&target.page.id)
            .bind(&target.page.name)
            .bind(&target.page.avatar_url)
            .bind(post.created_at)
            .bind(post.created_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            sqlx::query(
                r#"
                INSERT INTO post_targets (post_id, page_id, position, state)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&post.id)
            .bind(&target.page.id)
            .bind(position as i64)
            .bind(target.state.as_str())
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Targets of a post in publish order
    pub async fn get_targets(&self, post_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.avatar_url, t.state
            FROM post_targets t
            JOIN pages p ON p.id = t.page_id
            WHERE t.post_id = ?
            ORDER BY t.position
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<Target> {
                let state = r
                    .get::<String, _>("state")
                    .parse::<TargetState>()
                    .map_err(|e| DbError::CorruptRow {
                        table: "post_targets",
                        reason: e.to_string(),
                    })?;
                Ok(Target {
                    page: page_from_row(r),
                    state,
                })
            })
            .collect()
    }

    /// Last error recorded for a target, if any
    pub async fn target_error(&self, post_id: &str, page_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT last_error FROM post_targets WHERE post_id = ? AND page_id = ?",
        )
        .bind(post_id)
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("last_error")))
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl PostStore for Database {
    async fn list_due(&self, before: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content, first_comment, image_url, image_blob, scheduled_at,
                   surface_publish_at, status, error, created_at, updated_at
            FROM posts
            WHERE status = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in &rows {
            let post_id: String = row.get("id");
            let targets = self.get_targets(&post_id).await?;
            posts.push(post_from_row(row, targets)?);
        }
        Ok(posts)
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, content, first_comment, image_url, image_blob, scheduled_at,
                   surface_publish_at, status, error, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        match row {
            Some(row) => {
                let targets = self.get_targets(post_id).await?;
                Ok(Some(post_from_row(&row, targets)?))
            }
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        post_id: &str,
        status: PostStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, error = ?, updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            warn!(
                post_id,
                "Post is no longer scheduled, status write-back to '{}' skipped", status
            );
        }
        Ok(())
    }

    async fn record_target(
        &self,
        post_id: &str,
        page_id: &str,
        outcome: &PublishOutcome,
    ) -> Result<()> {
        let state = match outcome {
            PublishOutcome::Published => TargetState::Published,
            PublishOutcome::RetryableFailure { .. } => TargetState::Pending,
            PublishOutcome::TerminalFailure { .. } => TargetState::Failed,
        };

        sqlx::query(
            r#"
            UPDATE post_targets SET state = ?, last_error = ?, attempted_at = ?
            WHERE post_id = ? AND page_id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(outcome.reason())
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .bind(page_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn page_from_row(r: &SqliteRow) -> Page {
    Page {
        id: r.get("id"),
        name: r.get("name"),
        avatar_url: r.get("avatar_url"),
    }
}

fn post_from_row(r: &SqliteRow, targets: Vec<Target>) -> Result<Post> {
    let status = r
        .get::<String, _>("status")
        .parse::<PostStatus>()
        .map_err(|e| DbError::CorruptRow {
            table: "posts",
            reason: e.to_string(),
        })?;

    let image = match (
        r.get::<Option<String>, _>("image_url"),
        r.get::<Option<Vec<u8>>, _>("image_blob"),
    ) {
        (Some(url), _) => Some(ImageRef::Url(url)),
        (None, Some(bytes)) => Some(ImageRef::Blob(bytes)),
        (None, None) => None,
    };

    Ok(Post {
        id: r.get("id"),
        content: r.get("content"),
        first_comment: r.get("first_comment"),
        image,
        scheduled_at: r.get("scheduled_at"),
        surface_publish_at: r.get("surface_publish_at"),
        status,
        error: r.get("error"),
        targets,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (temp_dir, db)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_create_and_get_post_with_targets() {
        let (_temp_dir, db) = create_test_db().await;

        let mut post = Post::scheduled(
            "Hello",
            now() - 60,
            vec![Page::new("a", "Page A"), Page::new("b", "Page B")],
        );
        post.first_comment = Some("First!".to_string());
        post.image = Some(ImageRef::Url("https://cdn.test/cat.png".to_string()));
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "Hello");
        assert_eq!(loaded.first_comment.as_deref(), Some("First!"));
        assert_eq!(loaded.image, post.image);
        assert_eq!(loaded.status, PostStatus::Scheduled);
        let ids: Vec<&str> = loaded.targets.iter().map(|t| t.page.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_blob_image_round_trip() {
        let (_temp_dir, db) = create_test_db().await;

        let mut post = Post::scheduled("Blob", now(), vec![Page::new("a", "A")]);
        post.image = Some(ImageRef::Blob(vec![0x89, 0x50, 0x4e, 0x47]));
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.image, Some(ImageRef::Blob(vec![0x89, 0x50, 0x4e, 0x47])));
    }

    #[tokio::test]
    async fn test_list_due_filters_status_and_time() {
        let (_temp_dir, db) = create_test_db().await;
        let t = now();

        let due = Post::scheduled("due", t - 10, vec![Page::new("a", "A")]);
        let future = Post::scheduled("future", t + 3600, vec![Page::new("a", "A")]);
        let mut draft = Post::scheduled("draft", t - 10, vec![Page::new("a", "A")]);
        draft.status = PostStatus::Draft;
        let mut published = Post::scheduled("done", t - 10, vec![Page::new("a", "A")]);
        published.status = PostStatus::Published;

        for post in [&due, &future, &draft, &published] {
            db.create_post(post).await.unwrap();
        }

        let listed = db.list_due(t).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[tokio::test]
    async fn test_list_due_orders_oldest_first() {
        let (_temp_dir, db) = create_test_db().await;
        let t = now();

        let newer = Post::scheduled("newer", t - 10, vec![]);
        let older = Post::scheduled("older", t - 100, vec![]);
        db.create_post(&newer).await.unwrap();
        db.create_post(&older).await.unwrap();

        let listed = db.list_due(t).await.unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);
    }

    #[tokio::test]
    async fn test_update_status_sets_error_and_keeps_schedule() {
        let (_temp_dir, db) = create_test_db().await;
        let post = Post::scheduled("x", now() - 10, vec![]);
        db.create_post(&post).await.unwrap();

        db.update_status(&post.id, PostStatus::Failed, Some("Access denied: b"))
            .await
            .unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("Access denied: b"));
        assert_eq!(loaded.scheduled_at, post.scheduled_at);
        assert!(loaded.updated_at >= post.updated_at);
    }

    #[tokio::test]
    async fn test_update_status_never_touches_drafts() {
        let (_temp_dir, db) = create_test_db().await;
        let mut post = Post::scheduled("x", now() - 10, vec![]);
        post.status = PostStatus::Draft;
        db.create_post(&post).await.unwrap();

        db.update_status(&post.id, PostStatus::Published, None)
            .await
            .unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Draft);
    }

    #[tokio::test]
    async fn test_record_target_states() {
        let (_temp_dir, db) = create_test_db().await;
        let post = Post::scheduled(
            "x",
            now() - 10,
            vec![Page::new("a", "A"), Page::new("b", "B"), Page::new("c", "C")],
        );
        db.create_post(&post).await.unwrap();

        db.record_target(&post.id, "a", &PublishOutcome::Published)
            .await
            .unwrap();
        db.record_target(
            &post.id,
            "b",
            &PublishOutcome::RetryableFailure {
                reason: "timeout".to_string(),
            },
        )
        .await
        .unwrap();
        db.record_target(
            &post.id,
            "c",
            &PublishOutcome::TerminalFailure {
                reason: "Access denied".to_string(),
            },
        )
        .await
        .unwrap();

        let targets = db.get_targets(&post.id).await.unwrap();
        assert_eq!(targets[0].state, TargetState::Published);
        assert_eq!(targets[1].state, TargetState::Pending);
        assert_eq!(targets[2].state, TargetState::Failed);
        assert_eq!(
            db.target_error(&post.id, "b").await.unwrap().as_deref(),
            Some("timeout")
        );
        assert_eq!(db.target_error(&post.id, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_page_management() {
        let (_temp_dir, db) = create_test_db().await;

        let mut page = Page::new("42", "Bakery");
        db.upsert_page(&page).await.unwrap();
        page.name = "Bakery & Cafe".to_string();
        page.avatar_url = Some("https://cdn.test/a.png".to_string());
        db.upsert_page(&page).await.unwrap();

        assert_eq!(db.get_page("42").await.unwrap(), Some(page.clone()));
        assert_eq!(db.list_pages().await.unwrap(), vec![page]);

        assert!(db.delete_page("42").await.unwrap());
        assert!(!db.delete_page("42").await.unwrap());
        assert!(db.get_page("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let (_temp_dir, db) = create_test_db().await;

        let result = sqlx::query(
            "INSERT INTO posts (id, content, scheduled_at, status, created_at, updated_at)
             VALUES ('x', 'c', 0, 'posted', 0, 0)",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_err(), "unknown statuses must be rejected");
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/test\0invalid.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(
            result,
            Err(crate::error::PagecastError::Database(_))
        ));
    }
}
