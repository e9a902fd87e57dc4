use std::thread;

use burn::tensor::backend::Backend;
use tracing::{info, warn};

use super::collective::{Communicator, communicators};
use super::partition::{Shard, split_between_processes};
use crate::error::{InferenceError, Result};

pub struct ProcessState<B: Backend> {
    device: B::Device,
    communicator: Communicator,
}

impl<B: Backend> ProcessState<B> {
    pub fn new(device: B::Device, communicator: Communicator) -> Self {
        Self {
            device,
            communicator,
        }
    }

    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn world_size(&self) -> usize {
        self.communicator.world_size()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    pub fn is_last_process(&self) -> bool {
        self.rank() + 1 == self.world_size()
    }

    pub fn split_between_processes<T: Clone>(
        &self,
        items: &[T],
        apply_padding: bool,
    ) -> Result<Shard<T>> {
        split_between_processes(items, self.world_size(), self.rank(), apply_padding)
    }

    pub fn gather_object<T>(&mut self, local: Vec<T>) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.communicator.gather_object(local)
    }

    pub fn abort(&mut self, reason: &str) {
        self.communicator.abort(reason);
    }
}

/// Reports the first error that is not a knock-on coordination failure.
pub fn launch<B, F, R, D>(world_size: usize, device_for_rank: D, worker: F) -> Result<Vec<R>>
where
    B: Backend,
    D: Fn(usize) -> B::Device,
    F: Fn(&mut ProcessState<B>) -> Result<R> + Sync,
    R: Send,
{
    let group = communicators(world_size)?;
    let worker = &worker;

    let outcomes: Vec<Result<R>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(world_size);
        for communicator in group {
            let rank = communicator.rank();
            let device = device_for_rank(rank);
            let spawned = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let mut state = ProcessState::<B>::new(device, communicator);
                    let outcome = worker(&mut state);
                    if let Err(err) = &outcome {
                        warn!(rank, "worker failed: {err}");
                        state.abort(&err.to_string());
                    }
                    outcome
                });
            handles.push((rank, spawned));
        }

        handles
            .into_iter()
            .map(|(rank, spawned)| {
                let handle = spawned.map_err(|err| {
                    InferenceError::coordination(format!("failed to spawn rank {rank}: {err}"))
                })?;
                handle.join().map_err(|_| {
                    InferenceError::coordination(format!("rank {rank} panicked"))
                })?
            })
            .collect()
    });

    let mut results = Vec::with_capacity(world_size);
    let mut first_error: Option<InferenceError> = None;
    for outcome in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(err) => {
                let replace = match &first_error {
                    None => true,
                    Some(InferenceError::Coordination(_)) => {
                        !matches!(err, InferenceError::Coordination(_))
                    }
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    info!(world_size, "all ranks finished");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use burn_ndarray::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn workers_split_and_gather_in_rank_order() {
        let items: Vec<usize> = (0..7).collect();
        let results = launch::<TestBackend, _, _, _>(
            3,
            |_| Default::default(),
            |state| {
                let shard = state.split_between_processes(&items, true)?;
                let doubled: Vec<usize> = shard.items.iter().map(|value| value * 2).collect();
                let gathered = state.gather_object(doubled)?;
                Ok((state.is_main_process(), gathered))
            },
        )
        .expect("launch");

        assert_eq!(results.len(), 3);
        assert!(results[0].0);
        assert!(!results[1].0 && !results[2].0);
        for (_, gathered) in results {
            assert_eq!(gathered.len(), 9);
            let truncated: Vec<usize> = gathered.into_iter().take(7).collect();
            assert_eq!(truncated, vec![0, 2, 4, 6, 8, 10, 12]);
        }
    }

    #[test]
    fn failing_worker_fails_the_launch_with_its_error() {
        let outcome = launch::<TestBackend, _, _, _>(
            3,
            |_| Default::default(),
            |state| {
                if state.rank() == 1 {
                    return Err(InferenceError::model("out of memory"));
                }
                state.gather_object(vec![state.rank()])
            },
        );
        assert_eq!(outcome.unwrap_err(), InferenceError::model("out of memory"));
    }

    #[test]
    fn panicking_worker_does_not_deadlock_peers() {
        let outcome = launch::<TestBackend, _, _, _>(
            2,
            |_| Default::default(),
            |state| {
                if state.is_last_process() {
                    panic!("device lost");
                }
                state.gather_object(vec![state.rank()])
            },
        );
        assert!(matches!(outcome, Err(InferenceError::Coordination(_))));
    }
}
