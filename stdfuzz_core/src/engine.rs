use crate::mutator::{Mutator, MutatorSet};
use rand_core::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Mutator '{mutator}' (#{index}) failed: {source}")]
pub struct MutationError {
    pub index: usize,
    pub mutator: String,
    #[source]
    pub source: anyhow::Error,
}

/// One derived test case and the mutator that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatedInput {
    pub mutator_index: usize,
    pub mutator_name: String,
    pub value: String,
}

/// Lazily applies each mutator of a set to the seed, in registration order.
///
/// Every mutator sees the original seed, never a previous mutator's output.
pub struct DerivedInputs<'a> {
    seed: &'a str,
    mutators: Box<dyn Iterator<Item = &'a dyn Mutator> + 'a>,
    rng: &'a mut dyn RngCore,
    index: usize,
}

impl<'a> DerivedInputs<'a> {
    pub fn new(seed: &'a str, mutators: &'a MutatorSet, rng: &'a mut dyn RngCore) -> Self {
        Self {
            seed,
            mutators: Box::new(mutators.iter()),
            rng,
            index: 0,
        }
    }
}

impl Iterator for DerivedInputs<'_> {
    type Item = Result<MutatedInput, MutationError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mutator = self.mutators.next()?;
        let index = self.index;
        self.index += 1;

        let result = mutator
            .mutate(self.seed, &mut *self.rng)
            .map(|value| MutatedInput {
                mutator_index: index,
                mutator_name: mutator.name().to_string(),
                value,
            })
            .map_err(|source| MutationError {
                index,
                mutator: mutator.name().to_string(),
                source,
            });
        Some(result)
    }
}

/// Eager form of [`DerivedInputs`]: exactly one output per mutator, or the first error.
pub fn derive_inputs(
    seed: &str,
    mutators: &MutatorSet,
    rng: &mut dyn RngCore,
) -> Result<Vec<MutatedInput>, MutationError> {
    DerivedInputs::new(seed, mutators, rng).collect()
}
