//! Getting one candidate list onto every rank.
//!
//! Two shapes:
//! - **from root**: one rank owns the list. The count goes out first; the
//!   payload follows only when the count is non-zero.
//! - **self-constructed**: every rank built its own list. Ranks exchange
//!   counts (and optionally a digest of the payload) and every rank checks
//!   that all contributions match its own. Nothing else is sent.

use mdsync_cache::FileAddr;
use mdsync_comm::wire::{decode_addrs, decode_count, encode_addrs, encode_count};
use mdsync_comm::{AgreementRecord, Communicator};
use mdsync_config::{log_comm_debug, log_sync_error};

use crate::candidates::CandidateList;
use crate::error::{Result, SyncError};

pub struct ListBroadcaster<'a> {
    comm: &'a dyn Communicator,
    verify_digest: bool,
}

impl<'a> ListBroadcaster<'a> {
    pub fn new(comm: &'a dyn Communicator, verify_digest: bool) -> Self {
        Self {
            comm,
            verify_digest,
        }
    }

    /// Root passes its list; every other rank passes an empty one and gets
    /// the root's list back.
    pub fn broadcast_from_root(&self, root: usize, list: Vec<FileAddr>) -> Result<Vec<FileAddr>> {
        let is_root = self.comm.rank() == root;

        let mut count_buf = if is_root {
            encode_count(list.len())?.to_vec()
        } else {
            Vec::new()
        };
        self.comm.broadcast(root, &mut count_buf)?;
        let count = decode_count(&count_buf)?;

        if count == 0 {
            log_comm_debug!("Empty list broadcast", root = root, rank = self.comm.rank());
            return Ok(Vec::new());
        }

        let mut payload = if is_root {
            encode_addrs(&list)
        } else {
            Vec::new()
        };
        self.comm.broadcast(root, &mut payload)?;

        if is_root {
            return Ok(list);
        }
        let delivered = decode_addrs(&payload, count)?;
        log_comm_debug!(
            "List received",
            root = root,
            rank = self.comm.rank(),
            count = count
        );
        Ok(delivered)
    }

    /// Exchange counts for a list every rank built independently.
    ///
    /// Fails with [`SyncError::ProtocolDivergence`] on every rank if any two
    /// ranks disagree.
    pub fn broadcast_self_constructed(&self, list: CandidateList) -> Result<CandidateList> {
        let local = AgreementRecord::for_list(list.as_slice(), self.verify_digest);
        let gathered = self.comm.all_gather(&local.to_bytes()?)?;

        for (peer, bytes) in gathered.iter().enumerate() {
            let theirs = AgreementRecord::from_bytes(bytes)?;
            if theirs.count != local.count {
                log_sync_error!(
                    "Candidate count mismatch",
                    rank = self.comm.rank(),
                    peer = peer,
                    local = local.count,
                    remote = theirs.count
                );
                return Err(SyncError::divergence(format!(
                    "rank {} built {} candidates, rank {} built {}",
                    self.comm.rank(),
                    local.count,
                    peer,
                    theirs.count
                )));
            }
            if theirs.digest != local.digest {
                log_sync_error!(
                    "Candidate digest mismatch",
                    rank = self.comm.rank(),
                    peer = peer,
                    count = local.count
                );
                return Err(SyncError::divergence(format!(
                    "rank {} and rank {} built different lists of {} candidates",
                    self.comm.rank(),
                    peer,
                    local.count
                )));
            }
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_comm::{LocalComm, LocalGroup};
    use std::thread;

    fn run_group<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Sync,
    {
        let comms = LocalGroup::new(size);
        thread::scope(|s| {
            let handles: Vec<_> = comms.into_iter().map(|c| s.spawn(|| f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_from_root_reaches_everyone() {
        let results = run_group(3, |comm| {
            let list = if comm.rank() == 1 {
                vec![10, 20, 30]
            } else {
                Vec::new()
            };
            ListBroadcaster::new(&comm, true)
                .broadcast_from_root(1, list)
                .unwrap()
        });
        assert!(results.iter().all(|l| l == &vec![10, 20, 30]));
    }

    #[test]
    fn test_from_root_empty_sends_count_only() {
        let stats = run_group(2, |comm| {
            let delivered = ListBroadcaster::new(&comm, false)
                .broadcast_from_root(0, Vec::new())
                .unwrap();
            assert!(delivered.is_empty());
            comm.stats()
        });
        assert_eq!(stats[0].broadcasts, 1);
        assert_eq!(stats[0].bytes_sent, 4);
    }

    #[test]
    fn test_self_constructed_agreement() {
        let results = run_group(4, |comm| {
            ListBroadcaster::new(&comm, true)
                .broadcast_self_constructed(CandidateList::from(vec![100, 350]))
                .map(CandidateList::into_vec)
        });
        for result in results {
            assert_eq!(result.unwrap(), vec![100, 350]);
        }
    }

    #[test]
    fn test_count_divergence_detected_everywhere() {
        let results = run_group(3, |comm| {
            let list = if comm.rank() == 2 {
                vec![100]
            } else {
                vec![100, 350]
            };
            ListBroadcaster::new(&comm, false).broadcast_self_constructed(CandidateList::from(list))
        });
        for result in results {
            assert!(matches!(result, Err(SyncError::ProtocolDivergence { .. })));
        }
    }

    #[test]
    fn test_digest_catches_same_count_different_list() {
        let results = run_group(2, |comm| {
            let list = if comm.rank() == 0 {
                vec![100, 350]
            } else {
                vec![100, 351]
            };
            ListBroadcaster::new(&comm, true).broadcast_self_constructed(CandidateList::from(list))
        });
        for result in results {
            assert!(matches!(result, Err(SyncError::ProtocolDivergence { .. })));
        }
    }
}
