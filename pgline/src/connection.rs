//! The connector protocol state machine.
use std::sync::Arc;

use lru::LruCache;

use crate::{
    Result,
    batch::Batch,
    common::ByteStr,
    config::Config,
    error::{Error, UnsupportedAuth},
    protocol::{
        BackendMessage, ProtocolError, TransactionStatus,
        backend::{Authentication, BackendKeyData},
        frontend,
    },
    row::{Column, columns_from},
    statement::StatementName,
    transport::{PgTransport, PgTransportExt},
};

/// Propagate a fatal error, transitioning the connector to `Failed` first.
macro_rules! try_io {
    ($self:ident, $expr:expr) => {
        match $expr {
            Ok(ok) => ok,
            Err(err) => return Err($self.break_connection(err.into())),
        }
    };
}

pub(crate) use try_io;

/// Lifecycle state of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No outstanding commands.
    Idle,
    /// Frontend traffic written, not yet synchronized.
    CommandsQueued,
    /// Synchronize sent, draining responses.
    AwaitingResults,
    /// Terminal. A failed connector is never reused; discard it.
    Failed,
}

/// A prepared statement retained on the connector.
pub(crate) struct CachedStatement {
    pub name: StatementName,
    /// Result column descriptors, cached once described so a later
    /// execution can skip Describe.
    pub columns: Option<Arc<[Column]>>,
}

/// Owns exactly one transport and drives the extended query sub-protocol.
///
/// A connector is a single-writer, single-reader pipeline: requests and
/// responses on one connection are strictly ordered, and result
/// consumption is FIFO in issuance order. It is created by
/// [`handshake`][Connector::handshake] on an already-open transport, and
/// becomes permanently unusable on any protocol violation or transport
/// failure.
pub struct Connector<T> {
    pub(crate) io: T,
    state: ConnectorState,
    txn: TransactionStatus,
    pub(crate) stmt_cache: LruCache<u64, CachedStatement>,
    cached_batch: Option<Batch>,
    key_data: Option<BackendKeyData>,
    server_params: Vec<(ByteStr, ByteStr)>,
}

impl<T> std::fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state)
            .field("txn", &self.txn)
            .finish_non_exhaustive()
    }
}

impl<T: PgTransport> Connector<T> {
    /// Perform the startup exchange on an already-open, ready transport.
    ///
    /// <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
    pub async fn handshake(io: T, config: &Config) -> Result<Self> {
        let mut connector = Self {
            io,
            state: ConnectorState::Idle,
            txn: TransactionStatus::Idle,
            stmt_cache: LruCache::new(config.stmt_cache_capacity),
            cached_batch: None,
            key_data: None,
            server_params: Vec::new(),
        };
        match connector.startup(config).await {
            Ok(()) => Ok(connector),
            Err(err) => Err(connector.break_connection(err)),
        }
    }

    async fn startup(&mut self, config: &Config) -> Result<()> {
        crate::common::span!("startup");
        self.io.send_startup(frontend::Startup {
            user: &config.user,
            database: Some(config.dbname.as_str()),
            replication: config.replication.as_deref(),
        });
        self.io.flush().await?;

        // The server sends an appropriate authentication request message, to
        // which the frontend replies. For all methods except GSSAPI, SSPI
        // and SASL there is at most one request and one response.
        loop {
            match self.recv_msg().await? {
                BackendMessage::Authentication(Authentication::Ok) => break,
                BackendMessage::Authentication(Authentication::CleartextPassword) => {
                    self.io.send(frontend::PasswordMessage { password: &config.pass });
                    self.io.flush().await?;
                },
                BackendMessage::Authentication(_) => return Err(UnsupportedAuth.into()),
                BackendMessage::ErrorResponse(err) => return Err(err.to_db_error()?.into()),
                msg => return Err(msg.unexpected("authentication").into()),
            }
        }

        // After AuthenticationOk a backend process is being started; expect
        // ParameterStatus*, BackendKeyData, then ReadyForQuery.
        loop {
            match self.recv_msg().await? {
                BackendMessage::ReadyForQuery(ready) => {
                    self.txn = ready.status;
                    break;
                },
                BackendMessage::BackendKeyData(key_data) => self.key_data = Some(key_data),
                BackendMessage::ErrorResponse(err) => return Err(err.to_db_error()?.into()),
                msg => return Err(msg.unexpected("startup").into()),
            }
        }

        #[cfg(feature = "log")]
        log::debug!("connected as {:?} to {:?}", config.user, config.dbname);

        Ok(())
    }

    /// Receive the next message, absorbing asynchronous traffic:
    /// parameter status reports are recorded, notices are logged.
    pub(crate) async fn recv_msg(&mut self) -> Result<BackendMessage> {
        loop {
            match self.io.recv::<BackendMessage>().await? {
                BackendMessage::ParameterStatus(status) => {
                    match self.server_params.iter_mut().find(|(name, _)| *name == status.name) {
                        Some((_, value)) => *value = status.value,
                        None => self.server_params.push((status.name, status.value)),
                    }
                },
                BackendMessage::NoticeResponse(notice) => {
                    #[cfg(feature = "log")]
                    match notice.to_notice() {
                        Ok(n) => log::warn!("{n}"),
                        Err(e) => log::warn!("unreadable notice: {e}"),
                    }
                    #[cfg(not(feature = "log"))]
                    let _ = notice;
                },
                msg => return Ok(msg),
            }
        }
    }

    /// Transition to the terminal `Failed` state.
    ///
    /// Every pending and future caller receives an unusable-connection
    /// error without any I/O being attempted.
    pub(crate) fn break_connection(&mut self, err: Error) -> Error {
        if self.state != ConnectorState::Failed {
            self.state = ConnectorState::Failed;
            #[cfg(feature = "log")]
            log::error!("connection broken: {err}");
        }
        err
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ConnectorState::Failed => Err(crate::error::BrokenError.into()),
            _ => Ok(()),
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnectorState) {
        self.state = state;
    }

    pub(crate) fn set_txn(&mut self, txn: TransactionStatus) {
        self.txn = txn;
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectorState::Failed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn
    }

    /// Last reported value of a run-time server parameter.
    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| *n == *name)
            .map(|(_, value)| value.as_str())
    }

    /// Token for out-of-band cancellation of whatever this connector is
    /// running. `None` when the server sent no key data.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.key_data.map(|key_data| CancelToken {
            process_id: key_data.process_id,
            secret_key: key_data.secret_key,
        })
    }

    /// Take the cached batch, or a fresh cacheable one.
    ///
    /// At most one batch is retained per connector; it was cleared before
    /// retention, so this behaves identically to constructing a new batch.
    pub fn take_batch(&mut self) -> Batch {
        match self.cached_batch.take() {
            Some(batch) => batch,
            None => {
                let mut batch = Batch::new();
                batch.cacheable(true);
                batch
            },
        }
    }

    /// Return a batch to the single cached-batch slot.
    ///
    /// The batch is retained only when it is cacheable, the slot is free,
    /// and the connector is still usable; otherwise it is simply dropped.
    pub fn store_batch(&mut self, mut batch: Batch) {
        if batch.is_cacheable() && self.cached_batch.is_none() && !self.is_broken() {
            batch.clear();
            self.cached_batch = Some(batch);
        }
    }

    /// Run a single unparameterized query via the simple query sub-protocol.
    ///
    /// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SIMPLE-QUERY>
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<crate::row::Row>> {
        self.ensure_usable()?;

        self.io.send(frontend::Query { sql });
        self.state = ConnectorState::CommandsQueued;
        try_io!(self, self.io.flush().await);
        self.state = ConnectorState::AwaitingResults;

        let mut rows = Vec::new();
        let mut columns: Option<Arc<[Column]>> = None;
        let mut error = None;

        loop {
            match try_io!(self, self.recv_msg().await) {
                BackendMessage::ReadyForQuery(ready) => {
                    self.txn = ready.status;
                    break;
                },
                BackendMessage::RowDescription(rd) => columns = Some(columns_from(&rd.fields)),
                BackendMessage::DataRow(row) => {
                    let Some(columns) = &columns else {
                        let err = ProtocolError::unexpected_phase(
                            crate::protocol::backend::DataRow::MSGTYPE,
                            "simple query",
                        );
                        return Err(self.break_connection(err.into()));
                    };
                    let values = try_io!(self, row.values());
                    rows.push(crate::row::Row::new(columns.clone(), values));
                },
                BackendMessage::CommandComplete(_) => columns = None,
                BackendMessage::EmptyQueryResponse(_) => { },
                BackendMessage::ErrorResponse(err) => {
                    error = Some(try_io!(self, err.to_db_error()));
                },
                msg => return Err(self.break_connection(msg.unexpected("simple query").into())),
            }
        }

        self.state = ConnectorState::Idle;
        match error {
            Some(err) => Err(err.into()),
            None => Ok(rows),
        }
    }

    /// Gracefully terminate the session.
    pub async fn close(mut self) -> Result<()> {
        if !self.is_broken() {
            self.io.send(frontend::Terminate);
            self.io.flush().await?;
        }
        Ok(())
    }
}

/// Out-of-band cancellation handle.
///
/// The cancel request travels on its own connection, identified by the
/// backend key data, and races with normal completion: whichever resolves
/// first wins. A command aborted by a won cancellation surfaces as
/// [`CommandOutcome::Cancelled`][crate::batch::CommandOutcome::Cancelled].
#[derive(Debug, Clone, Copy)]
pub struct CancelToken {
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    /// Deliver the cancel request over `io`, a *fresh* transport to the
    /// same server. The server closes the connection afterwards.
    pub async fn send<T: PgTransport>(self, mut io: T) -> Result<()> {
        io.send_cancel(frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        });
        io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::mock::{self, MockTransport};

    fn config() -> Config {
        Config::new("admin", "app").password("hunter2")
    }

    #[tokio::test]
    async fn handshake_retains_key_data_and_params() {
        let io = MockTransport::new(vec![
            mock::auth_ok(),
            mock::parameter_status("server_version", "17.0"),
            mock::backend_key_data(42, 1337),
            mock::ready(b'I'),
        ]);
        let connector = Connector::handshake(io, &config()).await.unwrap();

        assert_eq!(connector.state(), ConnectorState::Idle);
        assert_eq!(connector.transaction_status(), TransactionStatus::Idle);
        assert_eq!(connector.server_param("server_version"), Some("17.0"));
        assert!(connector.cancel_token().is_some());
        assert!(connector.io.flushes >= 1, "startup traffic was flushed");
    }

    #[tokio::test]
    async fn handshake_answers_cleartext_password() {
        let io = MockTransport::new(vec![
            mock::auth_cleartext(),
            mock::auth_ok(),
            mock::backend_key_data(1, 2),
            mock::ready(b'I'),
        ]);
        let connector = Connector::handshake(io, &config()).await.unwrap();

        // startup (untagged) then PasswordMessage carrying the password
        let sent = connector.io.sent();
        assert!(sent.windows(7).any(|w| w == b"hunter2"));
    }

    #[tokio::test]
    async fn handshake_rejects_unsupported_auth() {
        let io = MockTransport::new(vec![(
            b'R',
            bytes::Bytes::copy_from_slice(&10i32.to_be_bytes()),
        )]);
        let err = Connector::handshake(io, &config()).await.unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::UnsupportedAuth(_)));
    }

    #[tokio::test]
    async fn simple_query_collects_rows() {
        let io = MockTransport::new(vec![
            mock::auth_ok(),
            mock::backend_key_data(1, 2),
            mock::ready(b'I'),
            mock::row_description(&[("n", 23)]),
            mock::data_row(&[Some(&1i32.to_be_bytes())]),
            mock::data_row(&[None]),
            mock::command_complete("SELECT 2"),
            mock::ready(b'I'),
        ]);
        let mut connector = Connector::handshake(io, &config()).await.unwrap();

        let rows = connector.simple_query("SELECT n FROM t").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(connector.state(), ConnectorState::Idle);
    }

    #[tokio::test]
    async fn batch_slot_holds_at_most_one_cleared_batch() {
        let io = MockTransport::new(vec![mock::auth_ok(), mock::ready(b'I')]);
        let mut connector = Connector::handshake(io, &config()).await.unwrap();

        let mut first = connector.take_batch();
        first.push(crate::batch::BatchCommand::new("SELECT 1"));
        let second = connector.take_batch();

        connector.store_batch(first);
        connector.store_batch(second); // slot taken, dropped

        let reused = connector.take_batch();
        assert!(reused.is_empty(), "cached batch is cleared before reuse");
        assert!(connector.cached_batch.is_none());
    }
}
