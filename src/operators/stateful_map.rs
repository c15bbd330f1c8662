use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dataflow::EpochContext;
use crate::errors::BoxError;
use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;
use crate::recovery::SerializedState;
use crate::recovery::StateChange;
use crate::recovery::StateKey;
use crate::recovery::StepId;

type Mapper<S, V, R> = Box<dyn FnMut(S, V) -> Result<(Option<S>, R), BoxError>>;

/// Implements the stateful map operator.
///
/// Map incoming values, having access to a persistent shared state
/// for each key.
///
/// Decoded state is cached per key. The cache never disagrees with
/// the store because every update is staged in the same call that
/// changes the cache. Keys whose state is discarded are evicted and
/// read back from the store's tombstone if seen again.
pub(crate) struct StatefulMapLogic<S, V, R> {
    step_id: StepId,
    builder: Box<dyn Fn() -> S>,
    mapper: Mapper<S, V, R>,
    cache: HashMap<StateKey, Option<S>>,
}

impl<S, V, R> StatefulMapLogic<S, V, R>
where
    S: Serialize + DeserializeOwned,
{
    pub(crate) fn new(
        step_id: StepId,
        builder: impl Fn() -> S + 'static,
        mapper: impl FnMut(S, V) -> Result<(Option<S>, R), BoxError> + 'static,
    ) -> Self {
        Self {
            step_id,
            builder: Box::new(builder),
            mapper: Box::new(mapper),
            cache: HashMap::new(),
        }
    }

    fn load(&mut self, ctx: &EpochContext<'_>, key: &StateKey) -> RecoveryResult<S> {
        let state = match self.cache.remove(key) {
            Some(cached) => cached,
            None => ctx
                .store
                .get_latest(&self.step_id, key)?
                .map(|ser| ser.de::<S>())
                .transpose()?,
        };

        Ok(state.unwrap_or_else(|| {
            tracing::trace!("stateful_map {}: building initial state for {key:?}", self.step_id);
            (self.builder)()
        }))
    }

    /// Run the mapper for one value and stage the resulting state
    /// change in the current epoch.
    pub(crate) fn exec(
        &mut self,
        ctx: &mut EpochContext<'_>,
        key: StateKey,
        value: V,
    ) -> RecoveryResult<R> {
        let state = self.load(ctx, &key)?;
        let (updated_state, output) = (self.mapper)(state, value)
            .map_err(|err| RecoveryError::transform(&self.step_id, err))?;

        let change = match &updated_state {
            Some(state) => StateChange::Upsert(SerializedState::ser(state)?),
            None => StateChange::Discard,
        };
        ctx.store
            .stage_write(&self.step_id, &key, ctx.epoch, change)?;
        // Discarded keys are dropped from the cache entirely.
        if let Some(state) = updated_state {
            self.cache.insert(key, Some(state));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::Epoch;
    use crate::recovery::RecoveryStore;

    fn keep_max() -> StatefulMapLogic<Option<i64>, i64, Option<i64>> {
        StatefulMapLogic::new(StepId::new("keep_max"), || None, |max, value| {
            let new_max = max.map_or(value, |max: i64| max.max(value));
            Ok((Some(Some(new_max)), Some(new_max)))
        })
    }

    #[test]
    fn state_survives_commit_without_cache() {
        let mut store = RecoveryStore::ephemeral().unwrap();
        let key = StateKey::from("a");
        {
            let mut logic = keep_max();
            let mut ctx = EpochContext::new(Epoch(0), &mut store);
            assert_eq!(logic.exec(&mut ctx, key.clone(), 4).unwrap(), Some(4));
            assert_eq!(logic.exec(&mut ctx, key.clone(), 1).unwrap(), Some(4));
        }
        store.commit(Epoch(0)).unwrap();

        let mut logic = keep_max();
        let mut ctx = EpochContext::new(Epoch(1), &mut store);
        assert_eq!(logic.exec(&mut ctx, key, 2).unwrap(), Some(4));
    }

    #[test]
    fn discard_rebuilds_state() {
        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut logic: StatefulMapLogic<i64, bool, i64> =
            StatefulMapLogic::new(StepId::new("count"), || 0, |count, reset| {
                if reset {
                    Ok((None, count))
                } else {
                    Ok((Some(count + 1), count + 1))
                }
            });
        let key = StateKey::from("a");
        let mut ctx = EpochContext::new(Epoch(0), &mut store);

        assert_eq!(logic.exec(&mut ctx, key.clone(), false).unwrap(), 1);
        assert_eq!(logic.exec(&mut ctx, key.clone(), false).unwrap(), 2);
        assert_eq!(logic.exec(&mut ctx, key.clone(), true).unwrap(), 2);
        assert!(!logic.cache.contains_key(&key));
        assert_eq!(logic.exec(&mut ctx, key.clone(), false).unwrap(), 1);
        assert!(logic.cache.contains_key(&key));
    }

    #[test]
    fn discarded_keys_are_not_cached() {
        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut logic: StatefulMapLogic<i64, i64, i64> =
            StatefulMapLogic::new(StepId::new("once"), || 0, |_state, value| Ok((None, value)));
        let mut ctx = EpochContext::new(Epoch(0), &mut store);

        for n in 0..100 {
            let key = StateKey(format!("key-{n}"));
            assert_eq!(logic.exec(&mut ctx, key, n).unwrap(), n);
        }
        assert!(logic.cache.is_empty());
    }

    #[test]
    fn mapper_error_stages_nothing() {
        let mut store = RecoveryStore::ephemeral().unwrap();
        let mut logic: StatefulMapLogic<i64, i64, i64> =
            StatefulMapLogic::new(StepId::new("boom"), || 0, |_state, _value| {
                Err(BoxError::from("BOOM"))
            });
        let key = StateKey::from("a");
        let mut ctx = EpochContext::new(Epoch(0), &mut store);

        let err = logic.exec(&mut ctx, key.clone(), 1).unwrap_err();
        assert!(matches!(err, RecoveryError::Transform { .. }));
        assert_eq!(store.get_latest(&StepId::new("boom"), &key).unwrap(), None);
    }
}
