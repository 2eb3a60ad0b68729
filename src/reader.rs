//! Row-at-a-time result streaming.
//!
//! The reader task pulls rows from an open portal and hands them over a
//! channel of capacity one. It waits for channel capacity before asking the
//! link for the next row, so a consumer that stops reading holds the server
//! back after at most one fetch batch.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{FutureExt, Stream};
use tokio::sync::mpsc;

use crate::backend::{Fetched, Link};
use crate::connection::{cancellable, ConnectionCore};
use crate::data::{Columns, DataRow, DataTable};
use crate::error::{Error, Result};
use crate::pg::{PgResult, PgValue};
use crate::strand::{Task, TaskContext, TaskHandle, TaskKind};

pub(crate) enum ReaderEvent {
    Columns(Arc<Columns>),
    Row(DataRow),
    Done(String),
}

type Sender = mpsc::Sender<Result<ReaderEvent>>;

/// What a reader runs.
pub(crate) enum Source {
    Text(String),
    /// A statement prepared by name on the same connection
    Prepared(String),
}

/// Streaming read on a connection's strand.
pub struct ReaderTask {
    source: Source,
    params: Vec<PgValue>,
    fetch_size: usize,
    tx: Sender,
}

impl ReaderTask {
    pub(crate) fn new(source: Source, params: Vec<PgValue>, fetch_size: usize, tx: Sender) -> Self {
        Self {
            source,
            params,
            fetch_size,
            tx,
        }
    }

    async fn pump<L: Link>(&mut self, link: &mut L, ctx: &TaskContext<ConnectionCore<L>>) -> PgResult<Outcome> {
        let core = ctx.data();
        let start = async {
            match &self.source {
                Source::Text(sql) => link.start_stream(sql, &self.params, self.fetch_size).await,
                Source::Prepared(name) => {
                    link.start_stream_prepared(name, &self.params, self.fetch_size)
                        .await
                }
            }
        };
        let fields = cancellable(ctx, core.cancel_handle(), start).await?;
        let columns = Arc::new(Columns::from_fields(&fields));
        if self
            .tx
            .send(Ok(ReaderEvent::Columns(Arc::clone(&columns))))
            .await
            .is_err()
        {
            link.finish_stream().await?;
            return Ok(Outcome::Abandoned);
        }

        loop {
            // Only fetch once the consumer has room for the row
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    link.finish_stream().await?;
                    return Ok(Outcome::Cancelled);
                }
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        link.finish_stream().await?;
                        return Ok(Outcome::Abandoned);
                    }
                },
            };

            match cancellable(ctx, core.cancel_handle(), link.fetch()).await? {
                Fetched::Row(values) => {
                    permit.send(Ok(ReaderEvent::Row(DataRow::new(Arc::clone(&columns), values))));
                }
                Fetched::Done(tag) => {
                    permit.send(Ok(ReaderEvent::Done(tag)));
                    return Ok(Outcome::Finished);
                }
            }
        }
    }
}

enum Outcome {
    Finished,
    /// The reader was dropped before the last row.
    Abandoned,
    Cancelled,
}

#[async_trait]
impl<L: Link> Task<ConnectionCore<L>> for ReaderTask {
    type Output = ();

    fn kind(&self) -> TaskKind {
        TaskKind::Reader
    }

    async fn run(&mut self, ctx: &TaskContext<ConnectionCore<L>>) -> Result<()> {
        let core = ctx.data();
        core.begin(ctx.id())?;
        let mut link = core.link.lock().await;
        let outcome = self.pump(&mut *link, ctx).await;
        core.end(&link, outcome.as_ref().err());
        drop(link);

        match outcome {
            Ok(Outcome::Finished) => Ok(()),
            Ok(Outcome::Abandoned) => {
                tracing::debug!(task = ctx.id(), "reader dropped before the end of its rows");
                Ok(())
            }
            Ok(Outcome::Cancelled) => {
                let _ = self.tx.try_send(Err(Error::Cancelled));
                Err(Error::Cancelled)
            }
            Err(e) => {
                let err = Error::from(e);
                // The consumer sees the error in-line; the handle gets its own copy
                let _ = self.tx.try_send(Err(err.clone()));
                Err(err)
            }
        }
    }
}

/// Consumer side of a streaming read.
///
/// Yields rows in server order. Dropping the reader closes the portal and
/// lets the connection move on to its next task.
pub struct DataReader {
    rx: mpsc::Receiver<Result<ReaderEvent>>,
    task: TaskHandle<()>,
    columns: Option<Arc<Columns>>,
    command_tag: Option<String>,
    finished: bool,
    /// Keeps a pooled connection checked out while rows are pending
    lease: Option<Box<dyn Send + Sync>>,
}

impl DataReader {
    pub(crate) fn new(rx: mpsc::Receiver<Result<ReaderEvent>>, task: TaskHandle<()>) -> Self {
        Self {
            rx,
            task,
            columns: None,
            command_tag: None,
            finished: false,
            lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: impl Send + Sync + 'static) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    /// Result columns, waiting for the statement to start if needed.
    pub async fn columns(&mut self) -> Result<Arc<Columns>> {
        if let Some(columns) = &self.columns {
            return Ok(Arc::clone(columns));
        }
        match self.rx.recv().await {
            Some(Ok(ReaderEvent::Columns(columns))) => {
                self.columns = Some(Arc::clone(&columns));
                Ok(columns)
            }
            Some(Ok(_)) => Err(Error::Connection("row before row description".into())),
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Err(self.closed_error())
            }
        }
    }

    /// Error to report when the channel closed without one in-line.
    ///
    /// The task resolves its handle before dropping the sender, so its own
    /// error is ready by now; a failure that found the channel full is
    /// reported from there.
    fn closed_error(&mut self) -> Error {
        match (&mut self.task).now_or_never() {
            Some(Err(e)) => e,
            _ => Error::Cancelled,
        }
    }

    /// Next row, or `None` once the statement has completed.
    pub async fn next_row(&mut self) -> Result<Option<DataRow>> {
        futures::StreamExt::next(self).await.transpose()
    }

    /// Command tag, available after the last row.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    pub fn task_id(&self) -> crate::strand::TaskId {
        self.task.id()
    }

    /// Ask the reader task to stop; the next read reports `Cancelled`.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Read the remaining rows into a table.
    pub async fn collect(mut self) -> Result<DataTable> {
        let columns = self.columns().await?;
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        let tag = self.command_tag.take().unwrap_or_default();
        Ok(DataTable::new(columns, rows, tag))
    }
}

impl Stream for DataReader {
    type Item = Result<DataRow>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            let event = match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(event) => event,
            };
            match event {
                Some(Ok(ReaderEvent::Columns(columns))) => this.columns = Some(columns),
                Some(Ok(ReaderEvent::Row(row))) => return Poll::Ready(Some(Ok(row))),
                Some(Ok(ReaderEvent::Done(tag))) => {
                    this.command_tag = Some(tag);
                    this.finished = true;
                }
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(this.closed_error())));
                }
            }
        }
    }
}

impl fmt::Debug for DataReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataReader")
            .field("task", &self.task)
            .field("columns", &self.columns.as_ref().map(|c| c.len()))
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::connection::Connection;
    use crate::strand::EventQueue;
    use crate::testing::{MockConnector, MockLink, Script};

    async fn connection() -> (Connection<MockLink>, MockConnector) {
        let connector = MockConnector::new(Script::default());
        let queue = EventQueue::current().unwrap();
        let conn = Connection::open(&connector, &queue).await.unwrap();
        (conn, connector)
    }

    #[tokio::test]
    async fn test_rows_arrive_in_order() {
        let (conn, _) = connection().await;
        let mut reader = conn.stream("STREAM 5", vec![], 2).unwrap();
        assert_eq!(reader.columns().await.unwrap().names(), vec!["n"]);
        let mut seen = Vec::new();
        while let Some(row) = reader.next_row().await.unwrap() {
            seen.push(row.get::<_, i32>("n").unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(reader.command_tag(), Some("SELECT 5"));
        assert!(reader.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_reader_stays_bounded() {
        let (conn, connector) = connection().await;
        let mut reader = conn.stream("STREAM 1000", vec![], 4).unwrap();
        let first: Vec<_> = (&mut reader).take(2).collect().await;
        assert_eq!(first.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // two consumed, one parked in the channel, the rest of one batch in the link
        assert!(connector.rows_fetched() <= 2 + 1 + 4, "{}", connector.rows_fetched());

        drop(reader);
        let next = conn.execute("SELECT 1", vec![]).unwrap().await.unwrap();
        assert_eq!(next.scalar::<i64>().unwrap(), Some(1));
        assert!(connector.rows_fetched() < 1000);
        assert_eq!(connector.portals_closed(), 1);
    }

    #[tokio::test]
    async fn test_collect_and_stream_impl() {
        let (conn, _) = connection().await;
        let table = conn.stream("STREAM 3", vec![], 10).unwrap().collect().await.unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.affected_rows(), 3);

        let rows: Vec<_> = conn
            .stream("STREAM 2", vec![], 1)
            .unwrap()
            .map(|r| r.unwrap().get::<_, i32>(0).unwrap())
            .collect()
            .await;
        assert_eq!(rows, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_errors_reach_consumer() {
        let (conn, _) = connection().await;
        let mut reader = conn.stream("FAIL no such table", vec![], 10).unwrap();
        let err = reader.columns().await.unwrap_err();
        assert_eq!(err.code(), Some("42601"));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_close_failure_wins_over_cancel() {
        let (conn, connector) = connection().await;
        connector.fail_stream_close();
        let mut reader = conn.stream("STREAM 100", vec![], 1).unwrap();
        reader.next_row().await.unwrap();
        // let the next row fill the channel
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reader.cancel());

        let mut last = None;
        while let Some(item) = reader.next().await {
            last = Some(item);
        }
        let err = last.unwrap().unwrap_err();
        assert!(err.is_connection(), "{err:?}");
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn test_cancel_reader() {
        let (conn, _) = connection().await;
        let mut reader = conn.stream("STREAM 100", vec![], 1).unwrap();
        reader.next_row().await.unwrap();
        assert!(reader.cancel());
        let mut saw_cancel = false;
        while let Some(item) = reader.next().await {
            if matches!(item, Err(Error::Cancelled)) {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
        assert!(conn.execute("SELECT 1", vec![]).unwrap().await.is_ok());
    }
}
