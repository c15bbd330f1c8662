//! Definition of a dataflow.
//!
//! A dataflow is a linear chain of steps from one [`Source`] to one
//! [`Sink`]. Each step has a unique [`StepId`]; stateful steps use it
//! to keep their state apart in the recovery store.
//!
//! ```ignore
//! let out = TestingSink::new();
//! let flow = Dataflow::input("inp", TestingSource::new(payments))
//!     .key_on("key", |(user, _amount): &(String, i64)| user.clone())
//!     .map("amount", |(key, (_user, amount))| Ok::<_, BoxError>((key, amount)))
//!     .stateful_map("running_sum", || 0, |sum: i64, amount: i64| {
//!         Ok::<_, BoxError>((Some(sum + amount), sum + amount))
//!     })
//!     .output("out", out.clone());
//! ```

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::BoxError;
use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;
use crate::inputs::Source;
use crate::operators::stateful_map::StatefulMapLogic;
use crate::outputs::Sink;
use crate::recovery::Epoch;
use crate::recovery::RecoveryStore;
use crate::recovery::StateKey;
use crate::recovery::StepId;

/// What a step can see while processing an item.
pub struct EpochContext<'a> {
    pub(crate) epoch: Epoch,
    pub(crate) store: &'a mut RecoveryStore,
}

impl<'a> EpochContext<'a> {
    pub fn new(epoch: Epoch, store: &'a mut RecoveryStore) -> Self {
        Self { epoch, store }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

type Logic<I, T> = Box<dyn FnMut(&mut EpochContext<'_>, I) -> RecoveryResult<Vec<T>>>;

pub(crate) struct Input<I> {
    pub(crate) step_id: StepId,
    pub(crate) source: Box<dyn Source<I>>,
}

pub(crate) struct Output<O> {
    pub(crate) step_id: StepId,
    pub(crate) sink: Box<dyn Sink<O>>,
}

/// A dataflow under construction. Items of type `I` come out of the
/// input and are currently of type `T`.
pub struct Stream<I, T> {
    input: Input<I>,
    step_ids: Vec<StepId>,
    logic: Logic<I, T>,
}

impl<I: 'static, T: 'static> Stream<I, T> {
    fn then<U: 'static>(
        self,
        step_id: StepId,
        mut next: impl FnMut(&mut EpochContext<'_>, T) -> RecoveryResult<Vec<U>> + 'static,
    ) -> Stream<I, U> {
        let mut prev = self.logic;
        let logic: Logic<I, U> = Box::new(
            move |ctx: &mut EpochContext<'_>, item: I| -> RecoveryResult<Vec<U>> {
                let mut out = Vec::new();
                for mid in prev(&mut *ctx, item)? {
                    out.extend(next(&mut *ctx, mid)?);
                }
                Ok(out)
            },
        );

        let mut step_ids = self.step_ids;
        step_ids.push(step_id);
        Stream {
            input: self.input,
            step_ids,
            logic,
        }
    }

    /// Transform each item. An error crashes the execution.
    pub fn map<U: 'static, E: Into<BoxError>>(
        self,
        step_id: impl Into<String>,
        mut mapper: impl FnMut(T) -> Result<U, E> + 'static,
    ) -> Stream<I, U> {
        let step_id = StepId::new(step_id);
        let id = step_id.clone();
        self.then(step_id, move |_ctx, item| {
            mapper(item)
                .map(|out| vec![out])
                .map_err(|err| RecoveryError::transform(&id, err))
        })
    }

    /// Transform each item into any number of items.
    pub fn flat_map<U: 'static, It: IntoIterator<Item = U>, E: Into<BoxError>>(
        self,
        step_id: impl Into<String>,
        mut mapper: impl FnMut(T) -> Result<It, E> + 'static,
    ) -> Stream<I, U> {
        let step_id = StepId::new(step_id);
        let id = step_id.clone();
        self.then(step_id, move |_ctx, item| {
            mapper(item)
                .map(|out| out.into_iter().collect())
                .map_err(|err| RecoveryError::transform(&id, err))
        })
    }

    /// Keep only the items `predicate` returns true for.
    pub fn filter(
        self,
        step_id: impl Into<String>,
        mut predicate: impl FnMut(&T) -> bool + 'static,
    ) -> Stream<I, T> {
        self.then(StepId::new(step_id), move |_ctx, item| {
            Ok(if predicate(&item) { vec![item] } else { vec![] })
        })
    }

    /// Look at each item and the epoch it is in.
    pub fn inspect(
        self,
        step_id: impl Into<String>,
        mut inspector: impl FnMut(Epoch, &T) + 'static,
    ) -> Stream<I, T> {
        self.then(StepId::new(step_id), move |ctx, item| {
            inspector(ctx.epoch, &item);
            Ok(vec![item])
        })
    }

    /// Pair each item with the state key it should be routed on.
    pub fn key_on(
        self,
        step_id: impl Into<String>,
        mut key_fn: impl FnMut(&T) -> String + 'static,
    ) -> Stream<I, (StateKey, T)> {
        self.then(StepId::new(step_id), move |_ctx, item| {
            Ok(vec![(StateKey(key_fn(&item)), item)])
        })
    }

    /// Finish the dataflow by writing every item to `sink`.
    pub fn output(self, step_id: impl Into<String>, sink: impl Sink<T> + 'static) -> Dataflow<I, T> {
        Dataflow {
            input: self.input,
            step_ids: self.step_ids,
            logic: self.logic,
            output: Output {
                step_id: StepId::new(step_id),
                sink: Box::new(sink),
            },
        }
    }
}

impl<I: 'static, V: 'static> Stream<I, (StateKey, V)> {
    /// Map each value with access to a persistent state per key.
    ///
    /// `builder` creates the state the first time a key is seen, or
    /// after its state was discarded. `mapper` is called with the
    /// current state and the value and returns the updated state and
    /// a value to emit downstream. Returning [`None`] as the updated
    /// state discards the state for the key.
    ///
    /// State is snapshotted into the recovery store every epoch, so
    /// it must be serializable.
    pub fn stateful_map<S, R, E>(
        self,
        step_id: impl Into<String>,
        builder: impl Fn() -> S + 'static,
        mut mapper: impl FnMut(S, V) -> Result<(Option<S>, R), E> + 'static,
    ) -> Stream<I, (StateKey, R)>
    where
        S: Serialize + DeserializeOwned + 'static,
        R: 'static,
        E: Into<BoxError>,
    {
        let step_id = StepId::new(step_id);
        let mut logic = StatefulMapLogic::new(step_id.clone(), builder, move |state, value| {
            mapper(state, value).map_err(Into::into)
        });
        self.then(step_id, move |ctx, (key, value)| {
            let out = logic.exec(ctx, key.clone(), value)?;
            Ok(vec![(key, out)])
        })
    }
}

/// A complete dataflow, ready to run.
pub struct Dataflow<I, O> {
    pub(crate) input: Input<I>,
    step_ids: Vec<StepId>,
    logic: Logic<I, O>,
    pub(crate) output: Output<O>,
}

impl<I: 'static> Dataflow<I, I> {
    /// Start a dataflow reading from `source`.
    pub fn input(step_id: impl Into<String>, source: impl Source<I> + 'static) -> Stream<I, I> {
        Stream {
            input: Input {
                step_id: StepId::new(step_id),
                source: Box::new(source),
            },
            step_ids: Vec::new(),
            logic: Box::new(
                |_ctx: &mut EpochContext<'_>, item: I| -> RecoveryResult<Vec<I>> {
                    Ok(vec![item])
                },
            ),
        }
    }
}

impl<I, O> Dataflow<I, O> {
    /// All step IDs, in order, including the input and output.
    pub fn step_ids(&self) -> Vec<StepId> {
        let mut ids = vec![self.input.step_id.clone()];
        ids.extend(self.step_ids.iter().cloned());
        ids.push(self.output.step_id.clone());
        ids
    }

    /// Step IDs must be unique so state can't be mixed between steps.
    pub fn validate(&self) -> RecoveryResult<()> {
        let mut seen = BTreeSet::new();
        for step_id in self.step_ids() {
            if !seen.insert(step_id.clone()) {
                return Err(RecoveryError::Config(format!(
                    "multiple steps with ID {step_id:?}; step IDs must be unique"
                )));
            }
        }
        Ok(())
    }

    /// Run one input item through every step and write the results.
    pub(crate) fn process(&mut self, ctx: &mut EpochContext<'_>, item: I) -> RecoveryResult<()> {
        for out in (self.logic)(&mut *ctx, item)? {
            self.output
                .sink
                .write(ctx.epoch, out)
                .map_err(|err| RecoveryError::output(&self.output.step_id, err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::TestingSource;
    use crate::outputs::TestingSink;
    use crate::recovery::SerializedState;

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let flow = Dataflow::input("inp", TestingSource::new(vec![1]))
            .map("double", |x: i32| Ok::<_, BoxError>(x * 2))
            .map("double", |x: i32| Ok::<_, BoxError>(x * 2))
            .output("out", TestingSink::new());

        assert!(matches!(flow.validate(), Err(RecoveryError::Config(_))));
    }

    #[test]
    fn steps_chain_in_order() {
        let out = TestingSink::new();
        let mut flow = Dataflow::input("inp", TestingSource::new(Vec::<i32>::new()))
            .flat_map("dup", |x: i32| Ok::<_, BoxError>(vec![x, x + 1]))
            .filter("even", |x: &i32| x % 2 == 0)
            .map("str", |x: i32| Ok::<_, BoxError>(x.to_string()))
            .output("out", out.clone());
        flow.validate().unwrap();

        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut ctx = EpochContext::new(Epoch(0), &mut store);
        flow.process(&mut ctx, 1).unwrap();
        flow.process(&mut ctx, 4).unwrap();

        assert_eq!(out.items(), vec!["2", "4"]);
    }

    #[test]
    fn stateful_map_stages_state() {
        let out = TestingSink::new();
        let mut flow = Dataflow::input("inp", TestingSource::new(Vec::<(String, i64)>::new()))
            .key_on("key", |(key, _value)| key.clone())
            .map("value", |(key, (_key, value))| {
                Ok::<_, BoxError>((key, value))
            })
            .stateful_map(
                "running_sum",
                || 0,
                |sum: i64, value: i64| Ok::<_, BoxError>((Some(sum + value), sum + value)),
            )
            .output("out", out.clone());

        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut ctx = EpochContext::new(Epoch(0), &mut store);
        flow.process(&mut ctx, (String::from("a"), 1)).unwrap();
        flow.process(&mut ctx, (String::from("a"), 2)).unwrap();
        flow.process(&mut ctx, (String::from("b"), 5)).unwrap();

        assert_eq!(
            out.items(),
            vec![
                (StateKey::from("a"), 1),
                (StateKey::from("a"), 3),
                (StateKey::from("b"), 5),
            ]
        );
        assert_eq!(
            store
                .get_latest(&StepId::new("running_sum"), &StateKey::from("a"))
                .unwrap(),
            Some(SerializedState(String::from("3")))
        );
    }

    #[test]
    fn transform_errors_name_the_step() {
        let mut flow = Dataflow::input("inp", TestingSource::new(Vec::<i32>::new()))
            .map("boom", |_x: i32| Err::<i32, _>("BOOM"))
            .output("out", TestingSink::new());

        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut ctx = EpochContext::new(Epoch(0), &mut store);
        match flow.process(&mut ctx, 1) {
            Err(RecoveryError::Transform { step_id, source }) => {
                assert_eq!(step_id, StepId::new("boom"));
                assert_eq!(source.to_string(), "BOOM");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
