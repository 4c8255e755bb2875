//! Reader and writer over one read-write expression.

use super::{ExpressionId, PvReader, PvWriter, ReadListener, ReaderBuilder};
use crate::error::PvResult;
use crate::expression::ReadWriteExpression;
use crate::value::Value;
use std::time::Duration;

/// Reads the read side of a [`ReadWriteExpression`] and writes through its
/// write side.
///
/// Both halves use the builder's context and default source. Closing the
/// handle, or dropping its last clone, closes both.
#[derive(Clone, Debug)]
pub struct PvReadWriter {
    reader: PvReader,
    writer: PvWriter,
    id: ExpressionId,
}

impl PvReadWriter {
    pub(super) fn build<L>(
        builder: ReaderBuilder,
        expression: ReadWriteExpression,
        listener: L,
    ) -> PvResult<Self>
    where
        L: ReadListener + 'static,
    {
        let context = builder.context().clone();
        let source = builder.default_source().map(str::to_string);
        let (read, write) = expression.into_parts();

        let writer = PvWriter::with_default_source(&context, write, source.as_deref())?;
        let reader = builder.build()?;
        let id = match reader.add_expression(read, listener) {
            Ok(id) => id,
            Err(error) => {
                reader.close();
                writer.close();
                return Err(error);
            }
        };
        Ok(Self { reader, writer, id })
    }

    pub fn reader(&self) -> &PvReader {
        &self.reader
    }

    pub fn writer(&self) -> &PvWriter {
        &self.writer
    }

    /// Id of the read side within [`PvReadWriter::reader`]
    pub fn expression_id(&self) -> ExpressionId {
        self.id
    }

    pub fn write<F>(&self, value: Value, callback: F)
    where
        F: FnOnce(PvResult<()>) + Send + 'static,
    {
        self.writer.write(value, callback);
    }

    pub fn write_blocking(&self, value: Value, timeout: Duration) -> PvResult<()> {
        self.writer.write_blocking(value, timeout)
    }

    pub fn close(&self) {
        self.writer.close();
        self.reader.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }
}
