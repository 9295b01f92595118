//! Per-session terminal emulator that owns the scrollback.
//!
//! The emulator runs as an actor task. Output chunks arrive on a bounded
//! feed channel together with their sequence number; snapshots and resizes
//! go through a query channel and see every chunk fed before the query was
//! sent.

pub mod state;

mod task;

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use state::{Cursor, ScreenSnapshot};
use state::{Query, QueryResponse};

/// Feed channel depth. The PTY reader blocks when it is full, so a slow
/// emulator throttles the reader instead of dropping output.
const FEED_CAPACITY: usize = 256;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender half of the emulator feed: `(seq, chunk)`.
pub type ScreenFeed = mpsc::Sender<(u64, Bytes)>;

#[derive(Error, Debug)]
pub enum ScreenError {
    #[error("terminal emulator task died unexpectedly")]
    TaskDied,

    #[error("terminal emulator query timed out")]
    QueryTimeout,
}

#[derive(Clone)]
pub struct Screen {
    query_tx: mpsc::Sender<(Query, oneshot::Sender<QueryResponse>)>,
}

impl Screen {
    /// Spawn the emulator task. It exits once the feed and every `Screen`
    /// clone are dropped.
    pub fn spawn(cols: usize, rows: usize, scrollback_limit: usize) -> (Self, ScreenFeed) {
        let (query_tx, query_rx) = mpsc::channel(32);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);

        tokio::spawn(async move {
            let result = AssertUnwindSafe(task::run(feed_rx, query_rx, cols, rows, scrollback_limit))
                .catch_unwind()
                .await;
            if let Err(e) = result {
                tracing::error!("terminal emulator task panicked: {:?}", e);
            }
        });

        (Self { query_tx }, feed_tx)
    }

    /// Returns `ScreenError::QueryTimeout` if the task doesn't answer within
    /// 5 seconds.
    async fn query(&self, query: Query) -> Result<QueryResponse, ScreenError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send((query, tx))
            .await
            .map_err(|_| ScreenError::TaskDied)?;
        tokio::time::timeout(QUERY_TIMEOUT, rx)
            .await
            .map_err(|_| ScreenError::QueryTimeout)?
            .map_err(|_| ScreenError::TaskDied)
    }

    pub async fn snapshot(&self) -> Result<ScreenSnapshot, ScreenError> {
        match self.query(Query::Snapshot).await? {
            QueryResponse::Snapshot(snapshot) => Ok(snapshot),
            QueryResponse::Ok => Err(ScreenError::TaskDied),
        }
    }

    pub async fn resize(&self, cols: usize, rows: usize) -> Result<(), ScreenError> {
        self.query(Query::Resize { cols, rows }).await?;
        Ok(())
    }
}
