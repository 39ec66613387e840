//! Resumable enumerator sources.
//!
//! An enumerator produces a lazy, finite sequence of `(item, cursor)` pairs. The cursor paired
//! with an item is the position to resume from once that item has been processed; building
//! the same source again with that cursor continues with the next item.
//!
//! This module provides:
//! - **Enumerator**: the source trait, object safe as [`BoxEnumerator`]
//! - **ArrayEnumerator** / **RangeEnumerator**: in-memory sequences keyed by offset
//! - **tabular**: keyset-paginated rows, batches and relation handles
//! - **CsvSource**: rows and fixed-size chunks of delimited files
//! - **NestedEnumerator**: depth-first composition of several sources
//! - **EnumeratorBuilder**: uniform constructors for `build_enumerator`

pub mod array;
pub mod builder;
pub mod csv;
pub mod nested;
pub mod tabular;

pub use array::{ArrayEnumerator, RangeEnumerator};
pub use builder::EnumeratorBuilder;
pub use csv::{CsvBatchEnumerator, CsvRowEnumerator, CsvSource};
pub use nested::{level, LevelBuilder, NestedEnumerator};
pub use tabular::{
    BatchEnumerator, KeysetPager, RecordEnumerator, RelationBatchEnumerator, TabularOptions,
};

use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::error::Result;

/// A resumable source of `(item, cursor)` pairs.
#[async_trait]
pub trait Enumerator: Send {
    type Item: Send;

    /// Produce the next item and the cursor to resume after it, or `None` when exhausted.
    async fn next(&mut self) -> Result<Option<(Self::Item, Cursor)>>;

    /// Estimated total number of items, when the source can tell cheaply.
    ///
    /// May run a count query, so callers should not assume it is free.
    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// A type-erased enumerator.
pub type BoxEnumerator<T> = Box<dyn Enumerator<Item = T>>;

#[async_trait]
impl<E> Enumerator for Box<E>
where
    E: Enumerator + ?Sized,
{
    type Item = E::Item;

    async fn next(&mut self) -> Result<Option<(Self::Item, Cursor)>> {
        (**self).next().await
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        (**self).size().await
    }
}

/// Drain an enumerator into a vector.
pub async fn collect<E>(enumerator: &mut E) -> Result<Vec<(E::Item, Cursor)>>
where
    E: Enumerator + ?Sized,
{
    let mut items = Vec::new();
    while let Some(pair) = enumerator.next().await? {
        items.push(pair);
    }
    Ok(items)
}
