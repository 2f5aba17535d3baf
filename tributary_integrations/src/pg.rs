//! Helpers shared by the Postgres-backed destination stores.

use tributary_core::Error;

/// Connection-level failures are retryable by the destination writer; anything
/// else keeps its error chain.
pub(crate) fn pg_err(context: &str, e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
            Error::TransientNetwork(format!("{context}: {e}"))
        }
        other => Error::backend(context.to_string(), other),
    }
}

/// Run a `;`-separated DDL script one statement at a time.
pub(crate) async fn migrate(
    pool: &sqlx::PgPool,
    context: &str,
    ddl: &str,
) -> tributary_core::Result<()> {
    for stmt in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| pg_err(context, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(pg_err("x", sqlx::Error::PoolTimedOut).is_transient());
        assert!(!pg_err("x", sqlx::Error::RowNotFound).is_transient());
    }
}
