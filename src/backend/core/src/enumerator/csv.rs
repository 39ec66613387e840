//! Delimited-file sources.
//!
//! Rows are counted from 0, excluding the header row. Row enumerators use the row index as
//! cursor; batch enumerators group consecutive rows into fixed-size chunks and use the chunk
//! index, so a resumed batch enumerator always restarts on a chunk boundary.

use async_trait::async_trait;
use csv::{Reader, ReaderBuilder, StringRecord};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::path::Path;
use tracing::debug;

use super::Enumerator;
use crate::cursor::Cursor;
use crate::error::{ErrorCode, IterationError, Result};

/// A parsed delimited stream with a header row.
pub struct CsvSource<R> {
    reader: Reader<R>,
    headers: StringRecord,
    total_rows: Option<u64>,
}

impl CsvSource<File> {
    /// Open a comma-separated file; the row count comes from a separate pass over the file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_path_with(path, ReaderBuilder::new())
    }

    /// Open a file with a customised reader (delimiter, quoting, ...).
    ///
    /// Headers are always enabled.
    pub fn from_path_with(path: impl AsRef<Path>, mut builder: ReaderBuilder) -> Result<Self> {
        let path = path.as_ref();
        builder.has_headers(true);

        let mut counter = builder.from_path(path)?;
        let mut record = StringRecord::new();
        let mut total = 0u64;
        while counter.read_record(&mut record)? {
            total += 1;
        }
        debug!(path = %path.display(), rows = total, "Counted delimited rows");

        let mut source = Self::with_reader(builder.from_path(path)?)?;
        source.total_rows = Some(total);
        Ok(source)
    }
}

impl<R: Read + Send> CsvSource<R> {
    /// Wrap a reader of comma-separated data. The row count is unknown.
    pub fn from_reader(reader: R) -> Result<Self> {
        Self::with_reader(ReaderBuilder::new().has_headers(true).from_reader(reader))
    }

    fn with_reader(mut reader: Reader<R>) -> Result<Self> {
        let headers = reader.headers()?.clone();
        Ok(Self {
            reader,
            headers,
            total_rows: None,
        })
    }

    /// Declare the number of data rows, for sources whose size cannot be counted up front.
    pub fn with_size(mut self, rows: u64) -> Self {
        self.total_rows = Some(rows);
        self
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    /// Enumerate rows, resuming after the row index held by `cursor`.
    pub fn rows<T>(mut self, cursor: Option<Cursor>) -> Result<CsvRowEnumerator<R, T>>
    where
        T: DeserializeOwned + Send,
    {
        let start = resume_index(cursor.as_ref())?;
        self.skip_rows(start)?;
        Ok(CsvRowEnumerator {
            source: self,
            record: StringRecord::new(),
            next_index: start,
            _item: PhantomData,
        })
    }

    /// Enumerate chunks of `batch_size` rows, resuming after the chunk index held by `cursor`.
    pub fn batches<T>(mut self, batch_size: usize, cursor: Option<Cursor>) -> Result<CsvBatchEnumerator<R, T>>
    where
        T: DeserializeOwned + Send,
    {
        if batch_size == 0 {
            return Err(IterationError::configuration(
                ErrorCode::InvalidBatchSize,
                "batch_size must be at least 1",
            ));
        }
        let start = resume_index(cursor.as_ref())?;
        self.skip_rows(start.saturating_mul(batch_size as u64))?;
        Ok(CsvBatchEnumerator {
            source: self,
            record: StringRecord::new(),
            batch_size,
            next_chunk: start,
            _item: PhantomData,
        })
    }

    fn skip_rows(&mut self, count: u64) -> Result<()> {
        let mut record = StringRecord::new();
        for _ in 0..count {
            if !self.reader.read_record(&mut record)? {
                break;
            }
        }
        Ok(())
    }

    fn read_one<T: DeserializeOwned>(&mut self, record: &mut StringRecord) -> Result<Option<T>> {
        if !self.reader.read_record(record)? {
            return Ok(None);
        }
        Ok(Some(record.deserialize(Some(&self.headers))?))
    }
}

fn resume_index(cursor: Option<&Cursor>) -> Result<u64> {
    match cursor.filter(|c| !c.is_null()) {
        Some(cursor) => Ok(cursor.as_index()? + 1),
        None => Ok(0),
    }
}

/// Yields each data row with its 0-based index.
pub struct CsvRowEnumerator<R, T> {
    source: CsvSource<R>,
    record: StringRecord,
    next_index: u64,
    _item: PhantomData<fn() -> T>,
}

#[async_trait]
impl<R, T> Enumerator for CsvRowEnumerator<R, T>
where
    R: Read + Send,
    T: DeserializeOwned + Send,
{
    type Item = T;

    async fn next(&mut self) -> Result<Option<(T, Cursor)>> {
        match self.source.read_one(&mut self.record)? {
            Some(row) => {
                let cursor = Cursor::index(self.next_index);
                self.next_index += 1;
                Ok(Some((row, cursor)))
            }
            None => Ok(None),
        }
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(self.source.total_rows)
    }
}

/// Yields consecutive chunks of rows with the chunk's 0-based index.
pub struct CsvBatchEnumerator<R, T> {
    source: CsvSource<R>,
    record: StringRecord,
    batch_size: usize,
    next_chunk: u64,
    _item: PhantomData<fn() -> T>,
}

#[async_trait]
impl<R, T> Enumerator for CsvBatchEnumerator<R, T>
where
    R: Read + Send,
    T: DeserializeOwned + Send,
{
    type Item = Vec<T>;

    async fn next(&mut self) -> Result<Option<(Vec<T>, Cursor)>> {
        let mut chunk = Vec::with_capacity(self.batch_size);
        while chunk.len() < self.batch_size {
            match self.source.read_one(&mut self.record)? {
                Some(row) => chunk.push(row),
                None => break,
            }
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        let cursor = Cursor::index(self.next_chunk);
        self.next_chunk += 1;
        Ok(Some((chunk, cursor)))
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(self
            .source
            .total_rows
            .map(|rows| rows.div_ceil(self.batch_size as u64)))
    }
}
