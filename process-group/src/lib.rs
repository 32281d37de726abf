//! Collective communication among training workers.
//!
//! Every worker runs the same driver and meets the others at the collectives
//! defined here. The only primitive a backend must provide is
//! [ProcessGroup::all_gather_bytes]; reductions and object gathering are
//! built on top of it.

mod common;
mod local;
mod single;

pub use local::*;
pub use single::*;

use crate::common::*;

/// A set of workers that take part in collective operations.
pub trait ProcessGroup: Send + Sync {
    /// The index of this worker, in `0..world_size()`.
    fn rank(&self) -> usize;

    /// The number of workers in the group.
    fn world_size(&self) -> usize;

    /// Sends `bytes` to every worker and receives the payload of every worker
    /// ordered by rank. It blocks until all workers have called it.
    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

impl<T> ProcessGroup for &T
where
    T: ProcessGroup + ?Sized,
{
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        (**self).all_gather_bytes(bytes)
    }
}

impl<T> ProcessGroup for Arc<T>
where
    T: ProcessGroup + ?Sized,
{
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        (**self).all_gather_bytes(bytes)
    }
}

/// Gathers a serializable value from every worker, ordered by rank.
pub fn all_gather<T>(group: &dyn ProcessGroup, value: &T) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = serde_json::to_vec(value)?;
    group
        .all_gather_bytes(bytes)?
        .into_iter()
        .map(|bytes| -> Result<T> { Ok(serde_json::from_slice(&bytes)?) })
        .collect()
}

/// Element-wise sum of `values` over all workers.
///
/// Every worker must pass a slice of the same length. Values travel as their
/// bit patterns, so NaN and infinities reach every worker intact.
pub fn all_reduce_sum(group: &dyn ProcessGroup, values: &[f64]) -> Result<Vec<f64>> {
    if group.world_size() == 1 {
        return Ok(values.to_vec());
    }

    let bits: Vec<u64> = values.iter().map(|value| value.to_bits()).collect();
    let gathered = all_gather(group, &bits)?;
    let mut sum = vec![0.0; values.len()];

    for (rank, other) in gathered.into_iter().enumerate() {
        ensure!(
            other.len() == values.len(),
            "worker {} contributed {} values, but {} are expected",
            rank,
            other.len(),
            values.len()
        );
        sum.iter_mut()
            .zip(other)
            .for_each(|(lhs, rhs)| *lhs += f64::from_bits(rhs));
    }

    Ok(sum)
}

/// Averages a name-to-value mapping over all workers.
///
/// The values are reduced in sorted key order so that every worker agrees on
/// the layout, and the result keeps the insertion order of `dict`. With a
/// single worker the input is returned unchanged.
pub fn reduce_dict(
    group: &dyn ProcessGroup,
    dict: &IndexMap<String, f64>,
) -> Result<IndexMap<String, f64>> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(dict.clone());
    }

    let keys: Vec<String> = dict.keys().cloned().sorted().collect();
    let values: Vec<f64> = keys.iter().map(|key| dict[key]).collect();

    // all workers must report the same set of names
    let gathered_keys = all_gather(group, &keys)?;
    ensure!(
        gathered_keys.iter().all(|other| *other == keys),
        "workers disagree on the names to be reduced"
    );

    let sum = all_reduce_sum(group, &values)?;
    let averaged: HashMap<&str, f64> = keys
        .iter()
        .zip(sum)
        .map(|(key, sum)| (key.as_str(), sum / world_size as f64))
        .collect();

    let reduced = dict
        .keys()
        .map(|key| (key.clone(), averaged[key.as_str()]))
        .collect();
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_collectives_are_identities() -> Result<()> {
        let group = SingleProcess;
        assert!(group.is_main_process());
        assert_eq!(all_reduce_sum(&group, &[1.0, 2.5])?, vec![1.0, 2.5]);

        let dict: IndexMap<String, f64> = [("b".to_string(), 2.0), ("a".to_string(), 1.0)]
            .into_iter()
            .collect();
        let reduced = reduce_dict(&group, &dict)?;
        assert_eq!(reduced, dict);
        assert_eq!(reduced.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        Ok(())
    }
}
