use anyhow::anyhow;
use diesel::{result::Error as DieselError, QueryResult};

pub trait DieselErrorFixCause<T> {
    /// Diesel's error currently breaks cause chains to wrapped errors. Without special treatment, any details
    /// of inner errors are lost and not displayed in backtraces or error prints.
    ///
    /// This fixes the issue by unwrapping the inner errors.
    fn fix_cause(self) -> anyhow::Result<T>;
}

impl<T> DieselErrorFixCause<T> for QueryResult<T> {
    fn fix_cause(self) -> anyhow::Result<T> {
        self.map_err(unwrap_diesel_err)
    }
}

fn unwrap_diesel_err(diesel_err: DieselError) -> anyhow::Error {
    match diesel_err {
        DieselError::DeserializationError(e) => anyhow!(e),
        DieselError::SerializationError(e) => anyhow!(e),
        DieselError::QueryBuilderError(e) => anyhow!(e),
        DieselError::DatabaseError(kind, info) => {
            anyhow!("database error {:?}: {}", kind, info.message())
        }
        e => anyhow!(e),
    }
}
