use crate::cache::IndexError;

/// Connection-level failures become `Unavailable`; everything else is a backend error.
pub fn map_sqlx_error(err: sqlx::Error) -> IndexError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => IndexError::unavailable(err),
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to statement timeout") =>
        {
            IndexError::unavailable(db.message())
        }
        other => IndexError::backend(other),
    }
}
