use crate::{common::*, ProcessGroup};

type Message = (usize, Vec<u8>);

/// A group of workers living in the same process, typically one per thread.
///
/// Each member owns a receiver and a sender to every other member. Messages
/// of a peer that runs ahead are buffered until the matching collective.
#[derive(Debug)]
pub struct LocalGroup {
    rank: usize,
    senders: Vec<flume::Sender<Message>>,
    receiver: flume::Receiver<Message>,
    pending: Mutex<Vec<VecDeque<Vec<u8>>>>,
}

impl LocalGroup {
    /// Creates the members of a group of `world_size` workers, ordered by rank.
    pub fn new(world_size: usize) -> Result<Vec<Self>> {
        ensure!(world_size > 0, "world_size must be positive");

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| flume::unbounded()).unzip();

        let members = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                rank,
                senders: senders.clone(),
                receiver,
                pending: Mutex::new(vec![VecDeque::new(); world_size]),
            })
            .collect();

        Ok(members)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.senders.len()
    }

    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let rank = self.rank;

        for (peer, sender) in self.senders.iter().enumerate() {
            if peer == rank {
                continue;
            }
            sender
                .send((rank, bytes.clone()))
                .map_err(|_| format_err!("worker {} left the group", peer))?;
        }

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| format_err!("the message buffer is poisoned"))?;

        while pending
            .iter()
            .enumerate()
            .any(|(peer, queue)| peer != rank && queue.is_empty())
        {
            let (peer, payload) = self
                .receiver
                .recv()
                .map_err(|_| format_err!("all peers left the group"))?;
            pending[peer].push_back(payload);
        }

        let gathered = pending
            .iter_mut()
            .enumerate()
            .map(|(peer, queue)| {
                if peer == rank {
                    bytes.clone()
                } else {
                    // checked non-empty above
                    queue.pop_front().unwrap_or_default()
                }
            })
            .collect();

        Ok(gathered)
    }
}
