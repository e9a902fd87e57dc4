use crate::error::{InferenceError, Result};

/// The trailing `padding` entries are copies of the last input item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard<T> {
    pub rank: usize,
    pub items: Vec<T>,
    pub padding: usize,
}

impl<T> Shard<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_padding(&self) -> bool {
        self.padding > 0
    }

    pub fn real_items(&self) -> &[T] {
        &self.items[..self.items.len() - self.padding]
    }
}

/// Assign `rank` its contiguous block of `items`.
///
/// Padded: every rank gets `ceil(n / P)` entries taken from the input extended
/// with copies of its last item, so concatenating shards in rank order gives
/// the input followed by duplicates only. Ragged: balanced contiguous blocks,
/// the first `n % P` ranks holding one extra item.
pub fn split_between_processes<T: Clone>(
    items: &[T],
    num_processes: usize,
    rank: usize,
    apply_padding: bool,
) -> Result<Shard<T>> {
    if num_processes == 0 {
        return Err(InferenceError::Configuration(
            "num_processes must be positive".into(),
        ));
    }
    if rank >= num_processes {
        return Err(InferenceError::invalid(format!(
            "rank {rank} out of range for {num_processes} processes"
        )));
    }

    let total = items.len();
    let (start, end) = if apply_padding {
        let per_process = total.div_ceil(num_processes);
        (rank * per_process, (rank + 1) * per_process)
    } else {
        let base = total / num_processes;
        let remainder = total % num_processes;
        let start = rank * base + rank.min(remainder);
        let extra = usize::from(rank < remainder);
        (start, start + base + extra)
    };

    let real_end = end.min(total);
    let real_start = start.min(real_end);
    let mut shard: Vec<T> = items[real_start..real_end].to_vec();
    let padding = (end - start) - shard.len();
    if padding > 0 {
        if let Some(last) = items.last() {
            shard.extend(std::iter::repeat_n(last.clone(), padding));
        }
    }

    Ok(Shard {
        rank,
        items: shard,
        padding,
    })
}

pub fn partition<T: Clone>(
    items: &[T],
    num_processes: usize,
    apply_padding: bool,
) -> Result<Vec<Shard<T>>> {
    (0..num_processes.max(1))
        .map(|rank| split_between_processes(items, num_processes, rank, apply_padding))
        .collect()
}

pub fn truncate_gathered<T>(mut gathered: Vec<T>, original_len: usize) -> Vec<T> {
    gathered.truncate(original_len);
    gathered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_split_of_five_over_two() {
        let items = ["a", "b", "c", "d", "e"];
        let shards = partition(&items, 2, true).expect("partition");
        assert_eq!(shards[0].items, vec!["a", "b", "c"]);
        assert_eq!(shards[1].items, vec!["d", "e", "e"]);
        assert!(!shards[0].has_padding());
        assert_eq!(shards[1].padding, 1);
        assert_eq!(shards[1].real_items(), &["d", "e"]);
    }

    #[test]
    fn padded_round_trip_preserves_order_for_any_process_count() {
        for len in 0..12 {
            let items: Vec<usize> = (0..len).collect();
            for processes in 1..=8 {
                let shards = partition(&items, processes, true).expect("partition");
                let sizes: Vec<usize> = shards.iter().map(Shard::len).collect();
                assert!(sizes.iter().all(|&size| size == len.div_ceil(processes)));

                let gathered: Vec<usize> =
                    shards.into_iter().flat_map(|shard| shard.items).collect();
                assert_eq!(truncate_gathered(gathered, len), items);
            }
        }
    }

    #[test]
    fn ragged_split_covers_each_item_once() {
        for len in 0..12 {
            let items: Vec<usize> = (0..len).collect();
            for processes in 1..=8 {
                let shards = partition(&items, processes, false).expect("partition");
                let sizes: Vec<usize> = shards.iter().map(Shard::len).collect();
                let min = sizes.iter().min().copied().unwrap_or(0);
                let max = sizes.iter().max().copied().unwrap_or(0);
                assert!(max - min <= 1);
                assert!(shards.iter().all(|shard| !shard.has_padding()));

                let gathered: Vec<usize> =
                    shards.into_iter().flat_map(|shard| shard.items).collect();
                assert_eq!(gathered, items);
            }
        }
    }

    #[test]
    fn more_processes_than_items_pads_with_last() {
        let shards = partition(&["x", "y"], 4, true).expect("partition");
        let items: Vec<Vec<&str>> = shards.iter().map(|shard| shard.items.clone()).collect();
        assert_eq!(items, vec![vec!["x"], vec!["y"], vec!["y"], vec!["y"]]);
        assert_eq!(
            shards.iter().map(|shard| shard.padding).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );
    }

    #[test]
    fn rejects_zero_processes_and_bad_rank() {
        let err = split_between_processes(&[1, 2], 0, 0, true).unwrap_err();
        assert!(matches!(err, InferenceError::Configuration(_)));
        assert!(partition(&[1, 2], 0, false).is_err());

        let err = split_between_processes(&[1, 2], 2, 2, true).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidArgument(_)));
    }
}
