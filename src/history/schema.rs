//! Schema creation, startup migrations, and space pre-allocation.

use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, instrument};

use super::HistoryError;

pub(crate) const CREATE_MEDIA_TABLE: &str = "CREATE TABLE IF NOT EXISTS media(
  domain TEXT, url_path TEXT, referer TEXT,
  album_id TEXT, download_path TEXT,
  download_filename TEXT, original_filename TEXT,
  completed INTEGER NOT NULL,
  created_at TIMESTAMP, completed_at TIMESTAMP,
  PRIMARY KEY(domain, url_path, original_filename));";

/// Columns of the current schema, in declaration order.
const MEDIA_COLUMNS: &[&str] = &[
    "domain",
    "url_path",
    "referer",
    "album_id",
    "download_path",
    "download_filename",
    "original_filename",
    "completed",
    "created_at",
    "completed_at",
];

/// Columns added after the first schema revision.
const ADDED_COLUMNS: &[(&str, &str)] = &[
    ("album_id", "TEXT"),
    ("created_at", "TIMESTAMP"),
    ("completed_at", "TIMESTAMP"),
];

/// Free pages at or below which space is reserved on startup.
pub(crate) const PREALLOCATE_FREE_PAGE_THRESHOLD: i64 = 1024;

/// Size of the zero blob written to reserve space.
pub(crate) const PREALLOCATE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug)]
struct ColumnInfo {
    name: String,
    pk: i64,
}

async fn table_info(pool: &SqlitePool) -> Result<Vec<ColumnInfo>, sqlx::Error> {
    let rows = sqlx::query("PRAGMA table_info(media)")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("name")?,
                pk: row.try_get("pk")?,
            })
        })
        .collect()
}

/// Creates the table and runs every migration, in order.
#[instrument(skip(pool))]
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), HistoryError> {
    sqlx::query(CREATE_MEDIA_TABLE)
        .execute(pool)
        .await
        .map_err(|e| HistoryError::migration("create_table", &e))?;

    fix_primary_key(pool)
        .await
        .map_err(|e| HistoryError::migration("fix_primary_key", &e))?;
    add_missing_columns(pool)
        .await
        .map_err(|e| HistoryError::migration("add_columns", &e))?;
    move_bunkr_rows(pool)
        .await
        .map_err(|e| HistoryError::migration("bunkr_to_bunkrr", &e))?;
    Ok(())
}

/// Rebuilds `media` when its first column is not part of the primary key.
async fn fix_primary_key(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let columns = table_info(pool).await?;
    let degenerate = columns.first().is_some_and(|column| column.pk == 0);
    if !degenerate {
        return Ok(());
    }

    info!("rebuilding history table with composite primary key");
    let present: Vec<&str> = MEDIA_COLUMNS
        .iter()
        .copied()
        .filter(|name| columns.iter().any(|c| c.name == *name))
        .collect();
    let column_list = present.join(", ");

    let mut tx = pool.begin().await?;
    sqlx::query("DROP TABLE IF EXISTS media_rebuild")
        .execute(&mut *tx)
        .await?;
    sqlx::query(&CREATE_MEDIA_TABLE.replacen("media(", "media_rebuild(", 1))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "INSERT INTO media_rebuild ({column_list}) SELECT {column_list} FROM media \
         GROUP BY domain, url_path, original_filename"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query("DROP TABLE media").execute(&mut *tx).await?;
    sqlx::query("ALTER TABLE media_rebuild RENAME TO media")
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

async fn add_missing_columns(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let columns = table_info(pool).await?;
    for (name, column_type) in ADDED_COLUMNS {
        if columns.iter().any(|c| c.name == *name) {
            continue;
        }
        debug!(column = name, "adding history column");
        sqlx::query(&format!("ALTER TABLE media ADD COLUMN {name} {column_type}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Completed `bunkr` rows are carried over to the renamed `bunkrr` domain.
async fn move_bunkr_rows(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let copied = sqlx::query(
        "INSERT OR REPLACE INTO media (domain, url_path, referer, album_id, download_path, \
         download_filename, original_filename, completed, created_at, completed_at) \
         SELECT 'bunkrr', url_path, referer, album_id, download_path, download_filename, \
         original_filename, completed, created_at, completed_at \
         FROM media WHERE domain = 'bunkr' AND completed = 1",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let removed = sqlx::query("DELETE FROM media WHERE domain = 'bunkr'")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    if copied > 0 || removed > 0 {
        info!(copied, removed, "moved bunkr history rows to bunkrr");
    }
    Ok(())
}

/// Reserves space inside the database file when few free pages remain.
///
/// Returns whether a reservation was made.
#[instrument(skip(pool))]
pub(crate) async fn preallocate(
    pool: &SqlitePool,
    free_page_threshold: i64,
    bytes: u64,
) -> Result<bool, HistoryError> {
    let (free_pages,): (i64,) = sqlx::query_as("PRAGMA freelist_count")
        .fetch_one(pool)
        .await?;
    if free_pages > free_page_threshold {
        debug!(free_pages, "history store has enough free pages");
        return Ok(false);
    }

    info!(free_pages, bytes, "pre-allocating history store space");
    let size = i64::try_from(bytes).unwrap_or(i64::MAX);
    sqlx::query("CREATE TABLE IF NOT EXISTS t(x)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO t VALUES(zeroblob(?))")
        .bind(size)
        .execute(pool)
        .await?;
    sqlx::query("DROP TABLE t").execute(pool).await?;
    Ok(true)
}
