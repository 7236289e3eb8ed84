use crate::error::CfmError;
use std::iter::Sum;

/// Merges the queued values of a key, and its current value, into a new value.
///
/// `values` holds the pending values in no particular order followed, when the
/// key has one, by its current value. Values reach the combiner in arbitrary
/// groupings across processing passes, so the merge must be commutative and
/// associative. Returning `None` removes the key from the map.
pub trait Combiner<K, V>: Send + Sync {
    fn combine(&self, key: &K, values: Vec<V>) -> Result<Option<V>, CfmError>;
}

/// Adds values up. A sum equal to `V::default()` removes the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummingCombiner;

impl<K, V> Combiner<K, V> for SummingCombiner
where
    V: Sum<V> + PartialEq + Default,
{
    fn combine(&self, _key: &K, values: Vec<V>) -> Result<Option<V>, CfmError> {
        let sum: V = values.into_iter().sum();
        if sum == V::default() {
            Ok(None)
        } else {
            Ok(Some(sum))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Combiner, SummingCombiner};

    #[test]
    fn summing_adds_and_drops_zero() {
        let c = SummingCombiner;
        assert_eq!(
            Combiner::<&str, i64>::combine(&c, &"a", vec![1, 2]).expect("sum"),
            Some(3)
        );
        assert_eq!(
            Combiner::<&str, i64>::combine(&c, &"a", vec![5, -5]).expect("sum"),
            None
        );
    }
}
