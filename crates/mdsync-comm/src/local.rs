//! In-process communicator group.
//!
//! One [`LocalComm`] per rank, each meant to be moved onto its own thread.
//! Every ordered pair of ranks gets a dedicated unbounded channel, so frames
//! between two ranks stay FIFO and collectives issued in the same order on
//! every rank line up without tags.
//!
//! Dropping a rank's endpoint makes every later collective on its peers fail
//! with [`CommError::PeerDisconnected`] instead of hanging.

use std::cell::Cell;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mdsync_config::log_comm_debug;

use crate::{CommError, CommStats, Communicator, Result};

#[derive(Debug)]
enum Frame {
    Barrier,
    Data(Vec<u8>),
}

/// Builder for a fully connected in-process group
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected endpoints, indexed by rank.
    pub fn new(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "a group needs at least one rank");

        // channels[from][to]
        let mut senders: Vec<Vec<Option<Sender<Frame>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Frame>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = unbounded();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to_peers, from_peers))| LocalComm {
                rank,
                size,
                to_peers,
                from_peers,
                stats: Cell::new(CommStats::default()),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`LocalGroup`]
pub struct LocalComm {
    rank: usize,
    size: usize,
    to_peers: Vec<Option<Sender<Frame>>>,
    from_peers: Vec<Option<Receiver<Frame>>>,
    stats: Cell<CommStats>,
}

impl LocalComm {
    /// Snapshot of this endpoint's counters
    pub fn stats(&self) -> CommStats {
        self.stats.get()
    }

    fn bump(&self, f: impl FnOnce(&mut CommStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&peer| peer != self.rank)
    }

    fn send(&self, peer: usize, frame: Frame) -> Result<()> {
        if let Frame::Data(bytes) = &frame {
            let len = bytes.len() as u64;
            self.bump(|s| s.bytes_sent += len);
        }
        self.to_peers[peer]
            .as_ref()
            .ok_or(CommError::PeerDisconnected { peer })?
            .send(frame)
            .map_err(|_| CommError::PeerDisconnected { peer })
    }

    fn recv(&self, peer: usize) -> Result<Frame> {
        self.from_peers[peer]
            .as_ref()
            .ok_or(CommError::PeerDisconnected { peer })?
            .recv()
            .map_err(|_| CommError::PeerDisconnected { peer })
    }

    fn recv_data(&self, peer: usize) -> Result<Vec<u8>> {
        match self.recv(peer)? {
            Frame::Data(bytes) => Ok(bytes),
            Frame::Barrier => Err(CommError::UnexpectedFrame {
                peer,
                expected: "data",
            }),
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        for peer in self.peers() {
            self.send(peer, Frame::Barrier)?;
        }
        for peer in self.peers() {
            match self.recv(peer)? {
                Frame::Barrier => {}
                Frame::Data(_) => {
                    return Err(CommError::UnexpectedFrame {
                        peer,
                        expected: "barrier",
                    })
                }
            }
        }
        self.bump(|s| s.barriers += 1);
        log_comm_debug!("Barrier passed", rank = self.rank, size = self.size);
        Ok(())
    }

    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<()> {
        if root >= self.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.size,
            });
        }
        if self.rank == root {
            for peer in self.peers() {
                self.send(peer, Frame::Data(buf.clone()))?;
            }
        } else {
            *buf = self.recv_data(root)?;
        }
        self.bump(|s| s.broadcasts += 1);
        log_comm_debug!(
            "Broadcast complete",
            rank = self.rank,
            root = root,
            bytes = buf.len()
        );
        Ok(())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        for peer in self.peers() {
            self.send(peer, Frame::Data(local.to_vec()))?;
        }
        let mut gathered = Vec::with_capacity(self.size);
        for peer in 0..self.size {
            if peer == self.rank {
                gathered.push(local.to_vec());
            } else {
                gathered.push(self.recv_data(peer)?);
            }
        }
        self.bump(|s| s.all_gathers += 1);
        Ok(gathered)
    }
}
