use crate::application::repos::RepoError;

/// Translate a driver error into the repository taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("23505") => RepoError::Duplicate {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                },
                // undefined_table, undefined_column, invalid_text_representation,
                // foreign_key_violation
                Some("42P01" | "42703" | "22P02" | "23503") => RepoError::InvalidInput { message },
                Some("57014") => RepoError::Timeout,
                Some(code) if code.starts_with("23") => RepoError::Integrity { message },
                _ => RepoError::Persistence(message),
            }
        }
        other => RepoError::from_persistence(other),
    }
}
