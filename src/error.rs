use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Typed failures returned by every engine operation. Lifecycle and
/// permission violations are never retried; only `Store`/`Pool` errors
/// may be transient.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid input: {0}")]
    Validation(&'static str),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl ChatError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Pool(_) => true,
            ChatError::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Bounded retry for operations where a missed attempt is recoverable
/// (queue inserts, presence writes). Logic errors pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self { attempts }
    }

    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && tried < attempts => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
