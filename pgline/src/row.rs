//! Result rows and columns.
use std::sync::Arc;

use bytes::Bytes;

use crate::{
    common::ByteStr,
    protocol::{PgFormat, backend::FieldDescription},
    types::{CodecError, HostKind, Oid, TypeRegistry, Value},
};

/// Descriptor of one result column, shared by every row of a command.
#[derive(Debug, Clone)]
pub struct Column {
    name: ByteStr,
    type_oid: Oid,
    format: PgFormat,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }
}

impl From<&FieldDescription> for Column {
    fn from(field: &FieldDescription) -> Self {
        Self {
            name: field.name.clone(),
            type_oid: field.type_oid,
            format: field.format,
        }
    }
}

/// Build the shared column set of a command from its row description.
pub(crate) fn columns_from(fields: &[FieldDescription]) -> Arc<[Column]> {
    fields.iter().map(Column::from).collect()
}

/// Columns with every format replaced, for reusing cached descriptors under
/// a different requested result format.
pub(crate) fn with_format(columns: &Arc<[Column]>, format: PgFormat) -> Arc<[Column]> {
    if columns.iter().all(|c| c.format == format) {
        return columns.clone();
    }
    columns
        .iter()
        .map(|c| Column { format, ..c.clone() })
        .collect()
}

/// One result row: shared column descriptors plus raw value bytes.
///
/// Values decode on demand through the registry; when the batch ran with
/// all result types unknown, columns arrive in text format and are read
/// with [`Row::text`] instead.
#[derive(Debug)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value bytes of a column; `None` is NULL.
    pub fn get<I: Index>(&self, index: I) -> Result<Option<&Bytes>, CodecError> {
        let nth = index.position(&self.columns)?;
        Ok(self.values[nth].as_ref())
    }

    /// Decode a column through the registry, late-bound by the column's
    /// type oid.
    ///
    /// A text-format column decodes as [`Value::Text`] without consulting
    /// the registry.
    pub fn decode<I: Index>(
        &self,
        index: I,
        registry: &TypeRegistry,
    ) -> Result<Value, CodecError> {
        let nth = index.position(&self.columns)?;
        let column = &self.columns[nth];
        let Some(bytes) = &self.values[nth] else {
            return Ok(Value::Null);
        };

        match column.format {
            PgFormat::Text => match std::str::from_utf8(bytes) {
                Ok(text) => Ok(Value::Text(text.into())),
                Err(e) => Err(CodecError::malformed(format!("text column is not utf8: {e}"))),
            },
            PgFormat::Binary => registry
                .resolve_oid(&HostKind::Unknown, column.type_oid)?
                .converter()
                .decode(bytes.clone()),
        }
    }

    /// A column's unparsed text representation.
    pub fn text<I: Index>(&self, index: I) -> Result<Option<&str>, CodecError> {
        let nth = index.position(&self.columns)?;
        match &self.values[nth] {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| CodecError::malformed(format!("column is not utf8: {e}"))),
        }
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, columns: &[Column]) -> Result<usize, CodecError>;
}

impl Index for usize {
    fn position(self, columns: &[Column]) -> Result<usize, CodecError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(CodecError::IndexOutOfBounds { index: self }),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[Column]) -> Result<usize, CodecError> {
        columns
            .iter()
            .position(|c| c.name() == self)
            .ok_or_else(|| CodecError::ColumnNotFound { name: self.into() })
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

#[cfg(test)]
mod test {
    use super::*;

    fn columns() -> Arc<[Column]> {
        Arc::from_iter([
            Column { name: ByteStr::from_static("id"), type_oid: 23, format: PgFormat::Binary },
            Column { name: ByteStr::from_static("note"), type_oid: 25, format: PgFormat::Binary },
        ])
    }

    #[test]
    fn decodes_by_position_and_name() {
        let registry = TypeRegistry::default();
        let row = Row::new(
            columns(),
            vec![Some(Bytes::copy_from_slice(&7i32.to_be_bytes())), None],
        );

        assert_eq!(row.decode(0, &registry).unwrap(), Value::Int4(7));
        assert_eq!(row.decode("note", &registry).unwrap(), Value::Null);
        assert!(matches!(
            row.decode("missing", &registry).unwrap_err(),
            CodecError::ColumnNotFound { .. },
        ));
        assert!(matches!(
            row.decode(9, &registry).unwrap_err(),
            CodecError::IndexOutOfBounds { .. },
        ));
    }

    #[test]
    fn text_format_columns_stay_unparsed() {
        let registry = TypeRegistry::default();
        let row = Row::new(
            with_format(&columns(), PgFormat::Text),
            vec![Some(Bytes::from_static(b"7")), Some(Bytes::from_static(b"ok"))],
        );

        // an int4 column in text mode reads back as raw text
        assert_eq!(row.decode(0, &registry).unwrap(), Value::Text("7".into()));
        assert_eq!(row.text(1).unwrap(), Some("ok"));
    }
}
