use std::any::Any;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::debug;

use crate::error::{InferenceError, Result};

type Payload = Arc<dyn Any + Send + Sync>;

enum Message {
    Contribution {
        round: u64,
        rank: usize,
        payload: Payload,
    },
    Abort {
        rank: usize,
        reason: String,
    },
    Departed {
        rank: usize,
    },
}

/// Contributions from a later round are stashed. Dropping a communicator notifies the peers.
pub struct Communicator {
    rank: usize,
    world_size: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    round: u64,
    departed: Vec<bool>,
    stash: Vec<(u64, usize, Payload)>,
}

pub fn communicators(world_size: usize) -> Result<Vec<Communicator>> {
    if world_size == 0 {
        return Err(InferenceError::Configuration(
            "a process group needs at least one process".into(),
        ));
    }

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

    Ok(receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| Communicator {
            rank,
            world_size,
            peers: senders.clone(),
            inbox,
            round: 0,
            departed: vec![false; world_size],
            stash: Vec::new(),
        })
        .collect())
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Every rank receives all local lists concatenated in rank order.
    pub fn gather_object<T>(&mut self, local: Vec<T>) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let round = self.round;
        self.round += 1;

        let mut slots: Vec<Option<Payload>> = vec![None; self.world_size];
        let payload: Payload = Arc::new(local);
        slots[self.rank] = Some(Arc::clone(&payload));

        let mut stashed = Vec::new();
        for (stash_round, rank, payload) in self.stash.drain(..) {
            if stash_round == round {
                slots[rank] = Some(payload);
            } else {
                stashed.push((stash_round, rank, payload));
            }
        }
        self.stash = stashed;

        if let Some(rank) = self.missing_departed(&slots) {
            return Err(departed_error(rank, round));
        }

        for (peer, sender) in self.peers.iter().enumerate() {
            if peer == self.rank || self.departed[peer] {
                continue;
            }
            // A closed inbox means the peer already left; its departure notice follows.
            let _ = sender.send(Message::Contribution {
                round,
                rank: self.rank,
                payload: Arc::clone(&payload),
            });
        }

        while slots.iter().any(Option::is_none) {
            let message = self
                .inbox
                .recv()
                .map_err(|_| InferenceError::coordination("collective inbox disconnected"))?;
            match message {
                Message::Contribution {
                    round: incoming,
                    rank,
                    payload,
                } => {
                    if incoming == round {
                        slots[rank] = Some(payload);
                    } else if incoming > round {
                        self.stash.push((incoming, rank, payload));
                    }
                }
                Message::Abort { rank, reason } => {
                    return Err(InferenceError::coordination(format!(
                        "rank {rank} aborted: {reason}"
                    )));
                }
                Message::Departed { rank } => {
                    self.departed[rank] = true;
                    if slots[rank].is_none() {
                        return Err(departed_error(rank, round));
                    }
                }
            }
        }

        let mut gathered = Vec::new();
        for (rank, slot) in slots.into_iter().enumerate() {
            let payload = slot.ok_or_else(|| departed_error(rank, round))?;
            let values = payload.downcast_ref::<Vec<T>>().ok_or_else(|| {
                InferenceError::coordination(format!(
                    "rank {rank} contributed a different payload type in round {round}"
                ))
            })?;
            gathered.extend(values.iter().cloned());
        }

        debug!(rank = self.rank, round, items = gathered.len(), "gather complete");
        Ok(gathered)
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.gather_object::<()>(Vec::new()).map(|_| ())
    }

    /// Tell every peer this rank is giving up; their pending collectives fail.
    pub fn abort(&mut self, reason: &str) {
        for (peer, sender) in self.peers.iter().enumerate() {
            if peer != self.rank {
                let _ = sender.send(Message::Abort {
                    rank: self.rank,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn missing_departed(&self, slots: &[Option<Payload>]) -> Option<usize> {
        self.departed
            .iter()
            .zip(slots)
            .position(|(&departed, slot)| departed && slot.is_none())
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        for (peer, sender) in self.peers.iter().enumerate() {
            if peer != self.rank {
                let _ = sender.send(Message::Departed { rank: self.rank });
            }
        }
    }
}

fn departed_error(rank: usize, round: u64) -> InferenceError {
    InferenceError::coordination(format!(
        "rank {rank} left the group before contributing to gather round {round}"
    ))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn gather_orders_by_rank_then_local_index() {
        let world_size = 4;
        let per_rank = 3;
        let comms = communicators(world_size).expect("group");

        let results: Vec<Vec<(usize, usize)>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|mut comm| {
                    scope.spawn(move || {
                        let local: Vec<(usize, usize)> =
                            (0..per_rank).map(|k| (comm.rank(), k)).collect();
                        comm.gather_object(local).expect("gather")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        for gathered in results {
            assert_eq!(gathered.len(), world_size * per_rank);
            for (index, &(rank, k)) in gathered.iter().enumerate() {
                assert_eq!(index, rank * per_rank + k);
            }
        }
    }

    #[test]
    fn ragged_lists_concatenate() {
        let comms = communicators(3).expect("group");
        let results: Vec<Vec<usize>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|mut comm| {
                    scope.spawn(move || {
                        let local = vec![comm.rank(); comm.rank() + 1];
                        comm.gather_object(local).expect("gather")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });
        for gathered in results {
            assert_eq!(gathered, vec![0, 1, 1, 2, 2, 2]);
        }
    }

    #[test]
    fn consecutive_rounds_stay_separate() {
        let comms = communicators(2).expect("group");
        let results: Vec<(Vec<usize>, Vec<usize>)> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|mut comm| {
                    scope.spawn(move || {
                        let first = comm.gather_object(vec![comm.rank()]).expect("first");
                        comm.barrier().expect("barrier");
                        let second = comm.gather_object(vec![comm.rank() + 10]).expect("second");
                        (first, second)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });
        for (first, second) in results {
            assert_eq!(first, vec![0, 1]);
            assert_eq!(second, vec![10, 11]);
        }
    }

    #[test]
    fn departed_peer_fails_the_gather() {
        let mut comms = communicators(2).expect("group");
        let leaver = comms.pop().expect("rank 1");
        let mut stayer = comms.pop().expect("rank 0");
        drop(leaver);

        let err = stayer.gather_object(vec![1u8]).unwrap_err();
        assert!(matches!(err, InferenceError::Coordination(_)));
    }

    #[test]
    fn abort_reaches_waiting_peer() {
        let mut comms = communicators(2).expect("group");
        let mut failing = comms.pop().expect("rank 1");
        let mut waiting = comms.pop().expect("rank 0");

        let err = thread::scope(|scope| {
            let handle = scope.spawn(move || waiting.gather_object(vec!["done".to_string()]));
            failing.abort("generation failed");
            handle.join().expect("join")
        })
        .unwrap_err();

        match err {
            InferenceError::Coordination(message) => {
                assert!(message.contains("generation failed"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn mismatched_payload_types_fail_every_rank() {
        let mut comms = communicators(2).expect("group");
        let mut second = comms.pop().expect("rank 1");
        let mut first = comms.pop().expect("rank 0");

        let (bytes, strings) = thread::scope(|scope| {
            let bytes = scope.spawn(move || first.gather_object(vec![1u8, 2]));
            let strings = scope.spawn(move || second.gather_object(vec!["two".to_string()]));
            (
                bytes.join().expect("join"),
                strings.join().expect("join"),
            )
        });

        assert!(matches!(bytes, Err(InferenceError::Coordination(_))));
        assert!(matches!(strings, Err(InferenceError::Coordination(_))));
    }

    #[test]
    fn single_process_gather_is_identity() {
        let mut comms = communicators(1).expect("group");
        let gathered = comms[0].gather_object(vec!["a", "b"]).expect("gather");
        assert_eq!(gathered, vec!["a", "b"]);
    }

    #[test]
    fn empty_group_is_a_configuration_error() {
        assert!(matches!(
            communicators(0),
            Err(InferenceError::Configuration(_))
        ));
    }
}
