//! PostgreSQL wire protocol engine.
//!
//! `pgline` speaks the native postgres protocol over an already-open byte
//! transport: it performs the startup handshake, executes parameterized
//! batches through the extended query sub-protocol, converts values
//! between a closed host value model and the binary wire encoding
//! (scalars, arrays, composites, ranges, enums), and decodes logical
//! replication streams into structured change events.
//!
//! # Examples
//!
//! ```no_run
//! use pgline::{BatchCommand, Config, Connector, PgStream, TypeRegistry, Value};
//!
//! # async fn app() -> pgline::Result<()> {
//! let config = Config::from_env();
//! let tcp = tokio::net::TcpStream::connect((config.get_host(), config.get_port())).await?;
//! let mut conn = Connector::handshake(PgStream::new(tcp), &config).await?;
//!
//! let registry = TypeRegistry::default();
//! let mut batch = conn.take_batch();
//! batch.push(BatchCommand::new("SELECT $1::int4 + 1").bind(41i32));
//!
//! let result = conn.run_batch(&mut batch, &registry).await?;
//! let row = &result.outcomes[0].rows()[0];
//! assert_eq!(row.decode(0, &registry)?, Value::Int4(42));
//!
//! conn.store_batch(batch);
//! # Ok(())
//! # }
//! ```
//!
//! Decoding a logical replication stream:
//!
//! ```no_run
//! use pgline::replication::{ReplicationBody, ReplicationStream};
//! # async fn app(io: pgline::PgStream<tokio::net::TcpStream>) -> pgline::Result<()> {
//! let mut stream =
//!     ReplicationStream::start(io, "START_REPLICATION SLOT events LOGICAL 0/0").await?;
//!
//! while let Some(msg) = stream.next_message().await? {
//!     if let ReplicationBody::Insert { relation_oid, .. } = msg.body {
//!         println!("insert into {relation_oid} at {}", msg.wal_start);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod protocol;

// Framing
pub mod transport;
#[cfg(feature = "tokio")]
mod stream;

// Types and values
pub mod row;
pub mod types;

// Component
mod statement;
pub mod batch;

// Operation
pub mod connection;
mod execute;
pub mod replication;

// Connection
pub mod config;

mod error;

pub use batch::{Batch, BatchCommand, BatchResult, CommandOutcome, Parameter};
pub use config::Config;
pub use connection::{CancelToken, Connector, ConnectorState};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{DatabaseError, ProtocolError, TransactionStatus};
pub use replication::{PgOutputDecoder, ReplicationMessage, ReplicationStream};
pub use row::Row;
#[cfg(feature = "tokio")]
pub use stream::PgStream;
pub use types::{CodecOptions, HostKind, TypeRegistry, Value};
