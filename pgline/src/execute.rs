//! The batch/command execution pipeline.
//!
//! Turns an ordered [`Batch`] into one pipelined wire sequence
//! (Parse/Bind/Describe/Execute per command, synchronization points per the
//! error barrier policy) and drains one result per command, preserving
//! order. Parameter types resolve before any byte is written.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use bytes::Bytes;

use crate::{
    Result,
    batch::{Batch, BatchResult, CommandOutcome},
    common::{ByteStr, span, verbose},
    connection::{CachedStatement, Connector, ConnectorState, try_io},
    protocol::{
        BackendMessage, DatabaseError, PgFormat, ProtocolError, TransactionStatus,
        backend::ErrorResponse,
        frontend,
    },
    row::{Column, Row, columns_from, with_format},
    statement::{PortalName, StatementName},
    transport::{PgTransport, PgTransportExt},
    types::{Oid, TypeRegistry, Value},
};

/// Statement text is normalized by trimming, then keyed by a 64 bit hash.
fn sql_key(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

/// What the drain phase expects back for one written command.
struct CommandPlan {
    key: u64,
    /// Parse was sent; expect ParseComplete and un-cache the statement if
    /// the command fails.
    parsed: bool,
    /// Describe was sent; expect RowDescription or NoData.
    described: bool,
    /// A Synchronize follows this command; expect ReadyForQuery after its
    /// terminal message.
    sync_after: bool,
    /// Close messages for evicted statements precede this command.
    closes_before: usize,
    /// Column descriptors when already known, skipping Describe.
    columns: Option<Arc<[Column]>>,
}

impl<T: PgTransport> Connector<T> {
    /// Execute a batch, streaming one outcome per command in issuance order.
    ///
    /// Without error barriers the whole batch shares one synchronization
    /// group: a failure at command `k` marks `k+1..` as skipped, and absent
    /// an explicit enclosing transaction the server discards the effects of
    /// earlier commands sharing the unsynchronized window. With barriers
    /// (batch-wide or per command) each barrier bounds the failure.
    pub async fn run_batch(
        &mut self,
        batch: &mut Batch,
        registry: &TypeRegistry,
    ) -> Result<BatchResult> {
        span!("run_batch");
        self.ensure_usable()?;
        if batch.is_empty() {
            return Ok(BatchResult { outcomes: Vec::new() });
        }

        // Resolve and encode every parameter up front; a type resolution
        // failure reports here, before any byte is sent, and leaves the
        // connector usable.
        let mut encoded = Vec::with_capacity(batch.len());
        for (index, command) in batch.commands().iter().enumerate() {
            encoded.push(
                encode_params(&command.params, registry)
                    .map_err(|e| e.with_context(format!("parameters of command {index}")))?,
            );
        }

        let format = match batch.is_all_results_unknown() {
            true => PgFormat::Text,
            false => PgFormat::Binary,
        };
        let barriers = batch.has_error_barriers();
        let portal = PortalName::unnamed();

        // Write phase: everything up to the terminating Synchronize is
        // pipelined and flushed in one go.
        let mut plans: Vec<CommandPlan> = Vec::with_capacity(batch.len());
        for (command, (oids, params)) in batch.commands.iter().zip(&encoded) {
            let sql = command.sql.trim();
            let key = sql_key(sql);

            let mut closes_before = 0;
            let (stmt, columns, parsed) = match self.stmt_cache.get(&key) {
                Some(cached) => {
                    verbose!("statement cache hit for {sql:?}");
                    (cached.name.clone(), cached.columns.clone(), false)
                },
                None => {
                    let stmt = StatementName::next();
                    let cached = CachedStatement { name: stmt.clone(), columns: None };
                    if let Some((_, evicted)) = self.stmt_cache.push(key, cached) {
                        // evicted statements are closed in the same
                        // pipelined sequence, before the new Parse
                        self.io.send(frontend::Close {
                            variant: frontend::Close::STATEMENT,
                            name: evicted.name.as_str(),
                        });
                        closes_before += 1;
                    }
                    self.io.send(frontend::Parse {
                        prepare_name: stmt.as_str(),
                        sql,
                        param_oids: oids.as_slice(),
                    });
                    (stmt, None, true)
                },
            };

            let columns = columns.map(|c| with_format(&c, format));
            let described = columns.is_none();

            self.io.send(frontend::Bind {
                portal_name: portal.as_str(),
                stmt_name: stmt.as_str(),
                params: params.as_slice(),
                result_format: format,
            });
            if described {
                self.io.send(frontend::Describe { kind: b'P', name: portal.as_str() });
            }
            self.io.send(frontend::Execute { portal_name: portal.as_str(), max_row: 0 });

            let sync_after = barriers || command.error_barrier;
            if sync_after {
                self.io.send(frontend::Sync);
            }
            plans.push(CommandPlan { key, parsed, described, sync_after, closes_before, columns });
        }
        // the batch is always terminated by a synchronization point
        if !plans.last().is_some_and(|p| p.sync_after) {
            self.io.send(frontend::Sync);
            plans.last_mut().expect("batch is non-empty").sync_after = true;
        }

        self.set_state(ConnectorState::CommandsQueued);
        try_io!(self, self.io.flush().await);
        self.set_state(ConnectorState::AwaitingResults);

        // Drain phase: one outcome per command, FIFO. An error aborts the
        // rest of its synchronization group without reading responses for
        // it; the group's ReadyForQuery restores normal processing.
        let mut outcomes = Vec::with_capacity(plans.len());
        let mut described_columns: Vec<Option<Arc<[Column]>>> = vec![None; plans.len()];
        let mut skip_group = false;

        for (index, plan) in plans.iter().enumerate() {
            if skip_group {
                if plan.parsed {
                    // the server discarded this command's Parse
                    self.stmt_cache.pop(&plan.key);
                }
                outcomes.push(CommandOutcome::Skipped);
            } else {
                let (outcome, described) = self.drain_command(plan).await?;
                if let Some(columns) = described {
                    if let Some(entry) = self.stmt_cache.peek_mut(&plan.key) {
                        entry.columns = Some(columns.clone());
                    }
                    described_columns[index] = Some(columns);
                }
                if !outcome.is_complete() {
                    skip_group = true;
                    self.set_txn(TransactionStatus::Failed);
                    if plan.parsed {
                        // the statement may not exist server side
                        self.stmt_cache.pop(&plan.key);
                    }
                }
                outcomes.push(outcome);
            }

            if plan.sync_after {
                let status = self.drain_ready().await?;
                self.set_txn(status);
                skip_group = false;
            }
        }

        self.set_state(ConnectorState::Idle);

        for (command, columns) in batch.commands.iter_mut().zip(described_columns) {
            if let Some(columns) = columns {
                command.columns = Some(columns);
            }
        }

        Ok(BatchResult { outcomes })
    }

    /// Read every response belonging to one command, up to but excluding
    /// its group's ReadyForQuery.
    async fn drain_command(
        &mut self,
        plan: &CommandPlan,
    ) -> Result<(CommandOutcome, Option<Arc<[Column]>>)> {
        for _ in 0..plan.closes_before {
            match try_io!(self, self.recv_msg().await) {
                BackendMessage::CloseComplete(_) => { },
                BackendMessage::ErrorResponse(err) => return Ok((self.classify(err)?, None)),
                msg => return Err(self.break_connection(msg.unexpected("closing statement").into())),
            }
        }

        if plan.parsed {
            match try_io!(self, self.recv_msg().await) {
                BackendMessage::ParseComplete(_) => { },
                BackendMessage::ErrorResponse(err) => return Ok((self.classify(err)?, None)),
                msg => return Err(self.break_connection(msg.unexpected("parsing").into())),
            }
        }

        match try_io!(self, self.recv_msg().await) {
            BackendMessage::BindComplete(_) => { },
            BackendMessage::ErrorResponse(err) => return Ok((self.classify(err)?, None)),
            msg => return Err(self.break_connection(msg.unexpected("binding").into())),
        }

        let mut columns = plan.columns.clone();
        let mut described = None;
        if plan.described {
            match try_io!(self, self.recv_msg().await) {
                BackendMessage::RowDescription(rd) => {
                    let built = columns_from(&rd.fields);
                    described = Some(built.clone());
                    columns = Some(built);
                },
                BackendMessage::NoData(_) => {
                    let empty: Arc<[Column]> = Arc::from_iter([]);
                    described = Some(empty.clone());
                    columns = Some(empty);
                },
                BackendMessage::ErrorResponse(err) => return Ok((self.classify(err)?, None)),
                msg => return Err(self.break_connection(msg.unexpected("describing").into())),
            }
        }

        let mut rows = Vec::new();
        loop {
            match try_io!(self, self.recv_msg().await) {
                BackendMessage::DataRow(row) => {
                    let Some(columns) = &columns else {
                        let err = ProtocolError::unexpected_phase(
                            crate::protocol::backend::DataRow::MSGTYPE,
                            "executing without description",
                        );
                        return Err(self.break_connection(err.into()));
                    };
                    let values = try_io!(self, row.values());
                    rows.push(Row::new(columns.clone(), values));
                },
                BackendMessage::CommandComplete(cmd) => {
                    let outcome = CommandOutcome::Complete {
                        rows_affected: cmd.rows_affected(),
                        tag: cmd.tag,
                        rows,
                    };
                    return Ok((outcome, described));
                },
                BackendMessage::EmptyQueryResponse(_) => {
                    let outcome = CommandOutcome::Complete {
                        rows_affected: 0,
                        tag: ByteStr::default(),
                        rows,
                    };
                    return Ok((outcome, described));
                },
                BackendMessage::PortalSuspended(_) => {
                    // only possible with a row limit; the portal is done
                    // as far as this pipeline is concerned
                    let outcome = CommandOutcome::Complete {
                        rows_affected: 0,
                        tag: ByteStr::default(),
                        rows,
                    };
                    return Ok((outcome, described));
                },
                BackendMessage::ErrorResponse(err) => {
                    return Ok((self.classify(err)?, described));
                },
                msg => return Err(self.break_connection(msg.unexpected("executing").into())),
            }
        }
    }

    async fn drain_ready(&mut self) -> Result<TransactionStatus> {
        match try_io!(self, self.recv_msg().await) {
            BackendMessage::ReadyForQuery(ready) => Ok(ready.status),
            msg => {
                Err(self.break_connection(msg.unexpected("awaiting synchronization").into()))
            },
        }
    }

    /// A server error aborts the command; a won cancellation race is the
    /// distinct `Cancelled` outcome rather than a generic failure.
    fn classify(&mut self, err: ErrorResponse) -> Result<CommandOutcome> {
        let db = match err.to_db_error() {
            Ok(db) => db,
            Err(protocol) => return Err(self.break_connection(protocol.into())),
        };
        Ok(match db.code() == DatabaseError::QUERY_CANCELED {
            true => CommandOutcome::Cancelled,
            false => CommandOutcome::Failed(db),
        })
    }
}

/// Resolve and binary-encode one command's parameters.
fn encode_params(
    params: &[crate::batch::Parameter],
    registry: &TypeRegistry,
) -> Result<(Vec<Oid>, Vec<Option<Bytes>>)> {
    let mut oids = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());

    for param in params {
        let wire = match &param.wire_name {
            Some(name) => Some(registry.wire_type_by_name(name)?.clone()),
            // an untyped NULL leaves the parameter type unspecified
            None if param.value.is_null() => None,
            None => Some(registry.default_wire_type(&param.value.kind())?),
        };
        match wire {
            None => {
                oids.push(0);
                values.push(None);
            },
            Some(wire) => {
                oids.push(wire.oid());
                match &param.value {
                    Value::Null => values.push(None),
                    value => {
                        let info = registry.resolve(&value.kind(), &wire)?;
                        values.push(info.encode(value)?);
                    },
                }
            },
        }
    }
    Ok((oids, values))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        batch::{BatchCommand, Parameter},
        config::Config,
        transport::mock::{self, MockTransport},
    };

    async fn connected(script: Vec<(u8, Bytes)>) -> Connector<MockTransport> {
        let mut frames = vec![mock::auth_ok(), mock::backend_key_data(7, 7), mock::ready(b'I')];
        frames.extend(script);
        Connector::handshake(MockTransport::new(frames), &Config::new("admin", "app"))
            .await
            .unwrap()
    }

    fn three_commands() -> Batch {
        let mut batch = Batch::new();
        batch
            .push(BatchCommand::new("INSERT INTO t VALUES ($1)").bind(1i32))
            .push(BatchCommand::new("INSERT INTO u VALUES ($1)").bind(Value::Null))
            .push(BatchCommand::new("INSERT INTO v VALUES (3)"));
        batch
    }

    /// Responses for one freshly parsed, described, row-less command.
    fn command_ok(tag: &str) -> Vec<(u8, Bytes)> {
        vec![
            mock::parse_complete(),
            mock::bind_complete(),
            mock::no_data(),
            mock::command_complete(tag),
        ]
    }

    #[tokio::test]
    async fn batch_without_barriers_shares_one_sync_group() {
        let mut script = command_ok("INSERT 0 1");
        script.push(mock::parse_complete());
        script.push(mock::bind_complete());
        script.push(mock::error_response("23505"));
        // command 3's responses never arrive; the group's sync response does
        script.push(mock::ready(b'I'));

        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();
        let mut batch = three_commands();
        let result = connector.run_batch(&mut batch, &registry).await.unwrap();

        assert!(result.outcomes[0].is_complete());
        let (index, err) = result.first_error().unwrap();
        assert_eq!(index, 1);
        assert_eq!(err.code(), "23505");
        assert!(matches!(result.outcomes[2], CommandOutcome::Skipped));
        assert_eq!(result.failed(), 1);

        // exactly one Sync was written
        let tags = connector.io.sent_tags();
        assert_eq!(tags.iter().filter(|t| **t == b'S').count(), 1);
        assert_eq!(connector.state(), ConnectorState::Idle);
    }

    #[tokio::test]
    async fn batch_with_barriers_isolates_the_failure() {
        let mut script = command_ok("INSERT 0 1");
        script.push(mock::ready(b'I'));
        script.push(mock::parse_complete());
        script.push(mock::bind_complete());
        script.push(mock::error_response("23505"));
        script.push(mock::ready(b'I'));
        script.extend(command_ok("INSERT 0 1"));
        script.push(mock::ready(b'I'));

        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();
        let mut batch = three_commands();
        batch.error_barriers(true);
        let result = connector.run_batch(&mut batch, &registry).await.unwrap();

        assert!(result.outcomes[0].is_complete());
        assert!(matches!(result.outcomes[1], CommandOutcome::Failed(_)));
        assert!(result.outcomes[2].is_complete(), "command 3 executes despite the failure");

        let tags = connector.io.sent_tags();
        assert_eq!(tags.iter().filter(|t| **t == b'S').count(), 3);
    }

    #[tokio::test]
    async fn cancellation_is_a_distinct_outcome() {
        let script = vec![
            mock::parse_complete(),
            mock::bind_complete(),
            mock::error_response("57014"),
            mock::ready(b'I'),
        ];
        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();

        let mut batch = Batch::new();
        batch.push(BatchCommand::new("SELECT pg_sleep(60)"));
        let result = connector.run_batch(&mut batch, &registry).await.unwrap();

        assert!(matches!(result.outcomes[0], CommandOutcome::Cancelled));
        assert!(result.first_error().is_none());
    }

    #[tokio::test]
    async fn type_resolution_fails_before_any_write() {
        let mut connector = connected(vec![]).await;
        let registry = TypeRegistry::default();

        let mut batch = Batch::new();
        batch.push(
            BatchCommand::new("SELECT $1")
                .bind(Parameter::with_wire_name(1i32, "no_such_type")),
        );

        let written = connector.io.sent_len();
        let err = connector.run_batch(&mut batch, &registry).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Codec(_)));
        assert_eq!(connector.io.sent_len(), written, "no bytes written");
        assert!(!connector.is_broken(), "resolution failures do not break the connector");
    }

    #[tokio::test]
    async fn sequencing_error_breaks_the_connector_for_good() {
        // DataRow while expecting ParseComplete is a protocol violation
        let script = vec![mock::data_row(&[None])];
        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();

        let mut batch = Batch::new();
        batch.push(BatchCommand::new("SELECT 1"));
        let err = connector.run_batch(&mut batch, &registry).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(connector.state(), ConnectorState::Failed);

        // a subsequent submit fails fast, writing nothing
        let written = connector.io.sent_len();
        let mut retry = Batch::new();
        retry.push(BatchCommand::new("SELECT 1"));
        let err = connector.run_batch(&mut retry, &registry).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Broken(_)));
        assert_eq!(connector.io.sent_len(), written, "zero bytes written after breakage");
    }

    #[tokio::test]
    async fn repeated_statement_skips_parse_and_describe() {
        let mut script = Vec::new();
        script.push(mock::parse_complete());
        script.push(mock::bind_complete());
        script.push(mock::row_description(&[("n", 23)]));
        script.push(mock::data_row(&[Some(&5i32.to_be_bytes())]));
        script.push(mock::command_complete("SELECT 1"));
        script.push(mock::ready(b'I'));
        // second run: no ParseComplete, no RowDescription
        script.push(mock::bind_complete());
        script.push(mock::data_row(&[Some(&6i32.to_be_bytes())]));
        script.push(mock::command_complete("SELECT 1"));
        script.push(mock::ready(b'I'));

        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();

        for expected in [5i32, 6] {
            let mut batch = Batch::new();
            batch.push(BatchCommand::new("SELECT n FROM t"));
            let result = connector.run_batch(&mut batch, &registry).await.unwrap();
            let rows = result.outcomes[0].rows();
            assert_eq!(rows[0].decode(0, &registry).unwrap(), Value::Int4(expected));
        }

        let tags = connector.io.sent_tags();
        assert_eq!(tags.iter().filter(|t| **t == b'P').count(), 1, "one Parse for two runs");
        assert_eq!(tags.iter().filter(|t| **t == b'D').count(), 1, "one Describe for two runs");
    }

    #[tokio::test]
    async fn evicted_statements_are_closed() {
        use std::num::NonZeroUsize;

        let mut script = command_ok("SELECT 0");
        script.push(mock::ready(b'I'));
        // second batch: Close for the evicted statement precedes Parse
        let mut second = vec![mock::close_complete()];
        second.extend(command_ok("SELECT 0"));
        second.push(mock::ready(b'I'));
        script.extend(second);

        let mut frames = vec![mock::auth_ok(), mock::backend_key_data(7, 7), mock::ready(b'I')];
        frames.extend(script);
        let config = Config::new("admin", "app").stmt_cache_capacity(NonZeroUsize::new(1).unwrap());
        let mut connector = Connector::handshake(MockTransport::new(frames), &config)
            .await
            .unwrap();
        let registry = TypeRegistry::default();

        let mut first = Batch::new();
        first.push(BatchCommand::new("SELECT 1"));
        connector.run_batch(&mut first, &registry).await.unwrap();

        let mut second = Batch::new();
        second.push(BatchCommand::new("SELECT 2"));
        connector.run_batch(&mut second, &registry).await.unwrap();

        let tags = connector.io.sent_tags();
        assert_eq!(tags.iter().filter(|t| **t == b'C').count(), 1, "one Close written");
    }

    #[tokio::test]
    async fn unknown_results_mode_requests_text_format() {
        let script = vec![
            mock::parse_complete(),
            mock::bind_complete(),
            mock::row_description(&[("n", 23)]),
            mock::data_row(&[Some(b"42")]),
            mock::command_complete("SELECT 1"),
            mock::ready(b'I'),
        ];
        let mut connector = connected(script).await;
        let registry = TypeRegistry::default();

        let mut batch = Batch::new();
        batch.push(BatchCommand::new("SELECT n FROM t"));
        batch.all_results_unknown(true);
        let result = connector.run_batch(&mut batch, &registry).await.unwrap();

        let rows = result.outcomes[0].rows();
        assert_eq!(rows[0].text(0).unwrap(), Some("42"));

        // the Bind message requested text format for results
        let sent = connector.io.sent();
        let bind_at = sent.iter().position(|b| *b == b'B').unwrap();
        let bind_len = u32::from_be_bytes(sent[bind_at + 1..bind_at + 5].try_into().unwrap());
        let bind_end = bind_at + 1 + bind_len as usize;
        assert_eq!(sent[bind_end - 2..bind_end], [0u8, 0], "result format code 0 (text)");
    }
}
