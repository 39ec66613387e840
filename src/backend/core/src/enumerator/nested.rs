//! Depth-first composition of enumerators.
//!
//! A nested enumerator is built from one [`LevelBuilder`] per level. Each builder receives
//! the items currently open at the enclosing levels plus its own resume slot, and returns
//! the enumerator for that level. Only innermost items are yielded.
//!
//! The composite cursor has one slot per level:
//! - the innermost slot holds the cursor of the last yielded leaf
//! - every outer slot holds the cursor of the last *fully consumed* item at that level
//!
//! Resuming therefore rebuilds each outer level positioned on the item that was in progress,
//! and the innermost level right after the last processed leaf.

use async_trait::async_trait;
use tracing::trace;

use super::{BoxEnumerator, Enumerator};
use crate::cursor::Cursor;
use crate::error::{ErrorCode, IterationError, Result};

/// Builds the enumerator of one nesting level.
pub type LevelBuilder<T> =
    Box<dyn Fn(&[T], Option<Cursor>) -> Result<BoxEnumerator<T>> + Send + Sync>;

/// Wrap a closure returning any enumerator into a [`LevelBuilder`].
pub fn level<T, E, F>(build: F) -> LevelBuilder<T>
where
    T: Send + 'static,
    E: Enumerator<Item = T> + 'static,
    F: Fn(&[T], Option<Cursor>) -> Result<E> + Send + Sync + 'static,
{
    Box::new(move |parents, cursor| Ok(Box::new(build(parents, cursor)?) as BoxEnumerator<T>))
}

/// Lazily walks the cross product of its levels, depth first.
pub struct NestedEnumerator<T> {
    levels: Vec<LevelBuilder<T>>,
    slots: Vec<Option<Cursor>>,
    frames: Vec<BoxEnumerator<T>>,
    open_items: Vec<T>,
    open_cursors: Vec<Cursor>,
    started: bool,
    finished: bool,
}

impl<T: Send + 'static> NestedEnumerator<T> {
    /// Compose `levels`, resuming from the composite `cursor`.
    pub fn new(levels: Vec<LevelBuilder<T>>, cursor: Option<Cursor>) -> Result<Self> {
        if levels.is_empty() {
            return Err(IterationError::configuration(
                ErrorCode::InvalidNestedLevel,
                "a nested enumerator needs at least one level",
            ));
        }

        let slots = match cursor {
            Some(cursor) => cursor.into_slots(levels.len())?,
            None => vec![None; levels.len()],
        };

        Ok(Self {
            levels,
            slots,
            frames: Vec::new(),
            open_items: Vec::new(),
            open_cursors: Vec::new(),
            started: false,
            finished: false,
        })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The composite cursor as of the last yielded leaf.
    pub fn cursor(&self) -> Cursor {
        Cursor::from_slots(self.slots.clone())
    }

    fn open_level(&mut self, index: usize) -> Result<()> {
        let enumerator = (self.levels[index])(&self.open_items, self.slots[index].clone())?;
        self.frames.push(enumerator);
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Enumerator for NestedEnumerator<T> {
    type Item = T;

    async fn next(&mut self) -> Result<Option<(T, Cursor)>> {
        let innermost = self.levels.len() - 1;

        loop {
            if self.finished {
                return Ok(None);
            }
            if !self.started {
                self.started = true;
                self.open_level(0)?;
            }

            let depth = self.frames.len() - 1;
            let pulled = self.frames[depth].next().await?;
            match pulled {
                Some((item, cursor)) if depth == innermost => {
                    self.slots[depth] = Some(cursor);
                    return Ok(Some((item, self.cursor())));
                }
                Some((item, cursor)) => {
                    self.open_items.push(item);
                    self.open_cursors.push(cursor);
                    self.open_level(depth + 1)?;
                }
                None => {
                    self.frames.pop();
                    if depth == 0 {
                        self.finished = true;
                        return Ok(None);
                    }
                    self.slots[depth] = None;
                    self.open_items.pop();
                    self.slots[depth - 1] = self.open_cursors.pop();
                    trace!(level = depth - 1, "Nested level item consumed");
                }
            }
        }
    }
}
