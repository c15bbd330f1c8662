use crate::errors::BoxError;
use crate::recovery::SerializedState;

use super::Source;
use super::SourceEvent;

/// Produce input from a fixed list of items.
///
/// Items are emitted in batches of `batch_size` followed by a
/// [`SourceEvent::BatchEnd`]. The snapshot is the position in the
/// list, so resuming skips exactly the items whose epochs committed
/// no matter how epochs and batches line up.
///
/// You almost assuredly do not want to use this unless you are
/// writing tests.
pub struct TestingSource<T> {
    items: Vec<T>,
    batch_size: usize,
    pos: usize,
    in_batch: usize,
}

impl<T> TestingSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            batch_size: 1,
            pos: 0,
            in_batch: 0,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl<T: Clone> Source<T> for TestingSource<T> {
    fn resume(&mut self, resume_state: Option<SerializedState>) -> Result<(), BoxError> {
        let skip = match resume_state {
            Some(state) => state.de::<usize>()?,
            None => 0,
        };
        self.pos = skip.min(self.items.len());
        self.in_batch = 0;
        tracing::debug!("Testing input skipping {} items", self.pos);
        Ok(())
    }

    fn next(&mut self) -> Result<SourceEvent<T>, BoxError> {
        if self.in_batch >= self.batch_size {
            self.in_batch = 0;
            return Ok(SourceEvent::BatchEnd);
        }
        match self.items.get(self.pos) {
            Some(item) => {
                self.pos += 1;
                self.in_batch += 1;
                Ok(SourceEvent::Item(item.clone()))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn snapshot(&self) -> Result<Option<SerializedState>, BoxError> {
        Ok(Some(SerializedState::ser(&self.pos)?))
    }
}
