//! Batches of parameterized commands and their outcomes.
use std::sync::Arc;

use crate::{
    common::ByteStr,
    protocol::DatabaseError,
    row::{Column, Row},
    types::Value,
};

/// One bound statement parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub(crate) value: Value,
    pub(crate) wire_name: Option<ByteStr>,
}

impl Parameter {
    pub fn new(value: impl Into<Value>) -> Self {
        Self { value: value.into(), wire_name: None }
    }

    /// Bind against a declared wire type instead of the value's default.
    pub fn with_wire_name(value: impl Into<Value>, wire_name: impl Into<ByteStr>) -> Self {
        Self { value: value.into(), wire_name: Some(wire_name.into()) }
    }
}

impl<V: Into<Value>> From<V> for Parameter {
    fn from(value: V) -> Self {
        Parameter::new(value)
    }
}

/// One parameterized statement within a [`Batch`].
#[derive(Debug, Clone)]
pub struct BatchCommand {
    pub(crate) sql: String,
    pub(crate) params: Vec<Parameter>,
    pub(crate) error_barrier: bool,
    /// Result column descriptors, populated once described.
    pub(crate) columns: Option<Arc<[Column]>>,
}

impl BatchCommand {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            error_barrier: false,
            columns: None,
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, param: impl Into<Parameter>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Append a synchronization point after this command, isolating later
    /// commands from its failure.
    pub fn error_barrier(mut self, on: bool) -> Self {
        self.error_barrier = on;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Result column descriptors, available after the command was described.
    pub fn columns(&self) -> Option<&[Column]> {
        self.columns.as_deref()
    }
}

/// Ordered sequence of commands executed as one pipelined unit.
#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) commands: Vec<BatchCommand>,
    error_barriers: bool,
    all_results_unknown: bool,
    cacheable: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: BatchCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Controls whether to place error barriers between all commands within
    /// this batch. Defaults to off.
    ///
    /// By default, a failing command causes later commands in the batch to
    /// be skipped, and earlier commands to be rolled back when no explicit
    /// transaction encloses the batch. Enabling error barriers ensures that
    /// errors do not affect other commands in the batch.
    ///
    /// Note that under an explicit transaction the first error places the
    /// transaction in a failed state, causing all later commands to fail in
    /// any case.
    ///
    /// At the wire protocol level, this corresponds to inserting a
    /// synchronization message after each command, rather than grouping the
    /// whole batch behind a single terminating one. Per-command barriers
    /// are controlled with [`BatchCommand::error_barrier`].
    pub fn error_barriers(&mut self, on: bool) -> &mut Self {
        self.error_barriers = on;
        self
    }

    /// Request all result columns in text format and leave them unparsed,
    /// bypassing codec resolution; rows are read with [`Row::text`].
    pub fn all_results_unknown(&mut self, on: bool) -> &mut Self {
        self.all_results_unknown = on;
        self
    }

    /// Mark this batch eligible for the connector's single cached-batch slot.
    pub fn cacheable(&mut self, on: bool) -> &mut Self {
        self.cacheable = on;
        self
    }

    pub fn commands(&self) -> &[BatchCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn has_error_barriers(&self) -> bool {
        self.error_barriers
    }

    pub(crate) fn is_all_results_unknown(&self) -> bool {
        self.all_results_unknown
    }

    pub(crate) fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Reset to an empty batch, retaining allocations and cacheability.
    pub(crate) fn clear(&mut self) {
        self.commands.clear();
        self.error_barriers = false;
        self.all_results_unknown = false;
    }
}

/// Per-command result of a batch run, in issuance order.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The command ran to completion.
    Complete {
        rows: Vec<Row>,
        rows_affected: u64,
        tag: ByteStr,
    },
    /// The server reported an error for this command.
    Failed(DatabaseError),
    /// The command did not complete because a cancel request won the race
    /// against normal completion. Not an error category.
    Cancelled,
    /// An earlier command in the same synchronization group failed; this
    /// one was discarded without executing.
    Skipped,
}

impl CommandOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, CommandOutcome::Complete { .. })
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            CommandOutcome::Complete { rows, .. } => rows,
            _ => &[],
        }
    }
}

/// Result of [`Connector::run_batch`][crate::connection::Connector::run_batch].
#[derive(Debug)]
pub struct BatchResult {
    pub outcomes: Vec<CommandOutcome>,
}

impl BatchResult {
    /// The first failed command, as (command index, error).
    pub fn first_error(&self) -> Option<(usize, &DatabaseError)> {
        self.outcomes.iter().enumerate().find_map(|(i, outcome)| match outcome {
            CommandOutcome::Failed(err) => Some((i, err)),
            _ => None,
        })
    }

    /// Count of commands whose outcome is [`CommandOutcome::Failed`].
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CommandOutcome::Failed(_)))
            .count()
    }
}
