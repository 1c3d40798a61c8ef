//! Logical replication message types.
use bytes::Bytes;

use crate::{common::ByteStr, types::Oid};

/// Log sequence number, a position in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// One decoded replication frame.
///
/// Every variant shares the prelude: WAL start and end positions and the
/// server wall clock at sending time.
#[derive(Debug, Clone)]
pub struct ReplicationMessage {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    /// Server clock, microseconds since the postgres epoch.
    pub server_clock: i64,
    pub body: ReplicationBody,
}

/// Variant payload of a [`ReplicationMessage`].
///
/// Row-change and schema variants carry an explicit transaction id only
/// while the transaction streams; otherwise the transaction is implied by
/// the surrounding Begin/Commit pair.
#[derive(Debug, Clone)]
pub enum ReplicationBody {
    /// A transaction starts; row changes follow.
    Begin {
        final_lsn: Lsn,
        commit_time: i64,
        xid: u32,
    },
    /// The current transaction committed.
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    /// Replication origin of the following changes.
    Origin {
        commit_lsn: Lsn,
        name: ByteStr,
    },
    /// Schema of a relation referenced by later row changes.
    Relation(Relation),
    /// Descriptor of a non-builtin type referenced by later changes.
    TypeDescriptor {
        xid: Option<u32>,
        oid: Oid,
        namespace: ByteStr,
        name: ByteStr,
    },
    Insert {
        xid: Option<u32>,
        relation_oid: u32,
        new: TupleData,
    },
    Update {
        xid: Option<u32>,
        relation_oid: u32,
        /// Replica identity key of the old row, when it changed.
        key: Option<TupleData>,
        /// The full old row, under REPLICA IDENTITY FULL.
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        xid: Option<u32>,
        relation_oid: u32,
        key: Option<TupleData>,
        old: Option<TupleData>,
    },
    Truncate {
        xid: Option<u32>,
        options: u8,
        relation_oids: Vec<u32>,
    },
    /// A block of changes for a streamed (in-progress) transaction begins.
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    /// The current streamed block ends; blocks of other transactions may
    /// interleave before this transaction continues.
    StreamStop,
    /// A streamed transaction committed.
    StreamCommit {
        xid: u32,
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    /// A streamed transaction, or one of its subtransactions, aborted.
    StreamAbort(StreamAbort),
}

/// Schema of a relation, sent before the first row change touching it.
#[derive(Debug, Clone)]
pub struct Relation {
    pub xid: Option<u32>,
    pub oid: u32,
    pub namespace: ByteStr,
    pub name: ByteStr,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    /// Bit 1 marks the column as part of the replica identity key.
    pub flags: u8,
    pub name: ByteStr,
    pub type_oid: Oid,
    pub type_modifier: i32,
}

/// Abort of a streamed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAbort {
    pub xid: u32,
    /// Equal to [`xid`][StreamAbort::xid] when the whole top-level
    /// transaction aborted.
    pub subtransaction_xid: u32,
}

impl StreamAbort {
    /// `true` when the whole top-level transaction aborted, `false` when
    /// only a subtransaction rolled back. Bookkeeping across multiple
    /// subtransactions is the consumer's concern.
    pub fn is_top_level(&self) -> bool {
        self.xid == self.subtransaction_xid
    }
}

/// Column values of one row change, in column order.
#[derive(Debug, Clone)]
pub struct TupleData(pub Vec<TupleValue>);

/// One column value within a [`TupleData`].
#[derive(Debug, Clone)]
pub enum TupleValue {
    /// NULL column.
    Null,
    /// Unchanged TOASTed value, not included in the stream.
    Toast,
    /// Text representation.
    Text(Bytes),
    /// Binary representation.
    Binary(Bytes),
}
