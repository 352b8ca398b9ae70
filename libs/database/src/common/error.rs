/// Failure of a readiness probe against a backing service
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[cfg(feature = "postgres")]
    #[error("metadata store probe failed: {0}")]
    Postgres(#[from] sea_orm::DbErr),

    #[cfg(feature = "redis")]
    #[error("credential cache probe failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected probe reply: {0}")]
    UnexpectedReply(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
