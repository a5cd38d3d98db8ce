use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{SeriesId, StoredRow};

const CREATE_STATISTICS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS long_term_statistics (
        series_id TEXT             NOT NULL,
        start     TIMESTAMPTZ      NOT NULL,
        state     DOUBLE PRECISION NOT NULL,
        sum       DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (series_id, start)
    )
"#;

/// Create the statistics table if it does not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_STATISTICS_TABLE).execute(pool).await?;
    Ok(())
}

/// Upsert rows for one series; the last write wins per `(series_id, start)`.
///
/// Callers must not pass two rows with the same `start` in one call:
/// Postgres refuses to update the same conflicting row twice in a statement.
pub async fn upsert_rows(pool: &PgPool, series: &SeriesId, rows: &[StoredRow]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO long_term_statistics (series_id, start, state, sum) ",
    );

    builder.push_values(rows, |mut b, row| {
        b.push_bind(series.as_str())
            .push_bind(row.start)
            .push_bind(row.state)
            .push_bind(row.sum);
    });
    builder.push(
        " ON CONFLICT (series_id, start) DO UPDATE SET state = EXCLUDED.state, sum = EXCLUDED.sum",
    );

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn first_row(pool: &PgPool, series: &SeriesId) -> Result<Option<StoredRow>> {
    let row = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT start, state, sum
        FROM long_term_statistics
        WHERE series_id = $1
        ORDER BY start
        LIMIT 1
        "#,
    )
    .bind(series.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Most recent row of a series.
pub async fn last_row(pool: &PgPool, series: &SeriesId) -> Result<Option<StoredRow>> {
    let row = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT start, state, sum
        FROM long_term_statistics
        WHERE series_id = $1
        ORDER BY start DESC
        LIMIT 1
        "#,
    )
    .bind(series.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Latest row with `not_before <= start < before`.
pub async fn last_row_before(
    pool: &PgPool,
    series: &SeriesId,
    before: OffsetDateTime,
    not_before: OffsetDateTime,
) -> Result<Option<StoredRow>> {
    let row = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT start, state, sum
        FROM long_term_statistics
        WHERE series_id = $1
          AND start <  $2
          AND start >= $3
        ORDER BY start DESC
        LIMIT 1
        "#,
    )
    .bind(series.as_str())
    .bind(before)
    .bind(not_before)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Time-ordered rows with `from <= start < to`.
pub async fn rows_in_range(
    pool: &PgPool,
    series: &SeriesId,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Vec<StoredRow>> {
    let rows = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT start, state, sum
        FROM long_term_statistics
        WHERE series_id = $1
          AND start >= $2
          AND start <  $3
        ORDER BY start
        "#,
    )
    .bind(series.as_str())
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Row holding the largest `sum` ever stored; the latest one wins a tie.
pub async fn row_with_max_sum(pool: &PgPool, series: &SeriesId) -> Result<Option<StoredRow>> {
    let row = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT start, state, sum
        FROM long_term_statistics
        WHERE series_id = $1
        ORDER BY sum DESC, start DESC
        LIMIT 1
        "#,
    )
    .bind(series.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn delete_rows_after(
    pool: &PgPool,
    series: &SeriesId,
    after: OffsetDateTime,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM long_term_statistics WHERE series_id = $1 AND start > $2")
        .bind(series.as_str())
        .bind(after)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_series(pool: &PgPool, series: &SeriesId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM long_term_statistics WHERE series_id = $1")
        .bind(series.as_str())
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
