use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::BoxError;
use crate::recovery::Epoch;

use super::Sink;

/// Append each output item to a shared list.
///
/// Clone this before handing it to a dataflow and read the items
/// back with [`TestingSink::items`] afterwards.
#[derive(Debug)]
pub struct TestingSink<T> {
    items: Rc<RefCell<Vec<T>>>,
}

impl<T> Clone for TestingSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for TestingSink<T> {
    fn default() -> Self {
        Self {
            items: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T: Clone> TestingSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.borrow().clone()
    }

    pub fn clear(&self) {
        self.items.borrow_mut().clear();
    }
}

impl<T> Sink<T> for TestingSink<T> {
    fn write(&mut self, _epoch: Epoch, item: T) -> Result<(), BoxError> {
        self.items.borrow_mut().push(item);
        Ok(())
    }
}
