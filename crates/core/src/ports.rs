//! Process-wide pool of local UDP ports
//!
//! The transcoder binds the reserved ports itself, so a reservation only
//! guarantees that no other session in this process is handed the same port
//! and that the port was bindable at the moment it was picked.
//!
//! Ports are handed out as even RTP ports. The odd port above each one is
//! held with it, since the transcoder binds RTCP on RTP port + 1.

use crate::config::PortConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

struct PoolInner {
    first_rtp: u32,
    pairs: usize,
    /// Next pair slot to try, so successive sessions walk the range instead
    /// of hammering the lowest ports
    cursor: usize,
    /// Every held port, RTCP neighbours included
    reserved: BTreeSet<u16>,
}

impl PoolInner {
    fn rtp_port(&self, slot: usize) -> u16 {
        // slot < pairs keeps this at or below range_end - 1
        (self.first_rtp + 2 * slot as u32) as u16
    }

    fn pair_is_free(&self, rtp: u16) -> bool {
        !self.reserved.contains(&rtp)
            && !self.reserved.contains(&(rtp + 1))
            && bindable(rtp)
            && bindable(rtp + 1)
    }
}

/// Shared port allocator; clones refer to the same pool
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<Mutex<PoolInner>>,
    reserve_timeout: Duration,
}

impl PortPool {
    pub fn new(config: &PortConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner {
                first_rtp: config.first_rtp_port(),
                pairs: config.rtp_pairs(),
                cursor: 0,
                reserved: BTreeSet::new(),
            })),
            reserve_timeout: config.reserve_timeout(),
        })
    }

    /// Number of ports currently held by live reservations, RTCP ports included
    pub fn in_use(&self) -> usize {
        self.inner.lock().reserved.len()
    }

    /// Reserve `count` RTP ports, waiting up to the configured timeout
    pub async fn reserve(&self, count: usize) -> Result<PortReservation> {
        self.reserve_within(count, self.reserve_timeout).await
    }

    pub async fn reserve_within(&self, count: usize, timeout: Duration) -> Result<PortReservation> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ports) = self.try_pick(count) {
                debug!(ports = ?ports, "reserved local ports");
                return Ok(PortReservation {
                    ports,
                    pool: Arc::clone(&self.inner),
                    released: AtomicBool::new(false),
                });
            }
            if Instant::now() + RETRY_INTERVAL > deadline {
                warn!(count, in_use = self.in_use(), "port pool exhausted");
                return Err(Error::PortsExhausted(format!(
                    "could not reserve {} port pairs within {:?}",
                    count, timeout
                )));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn try_pick(&self, count: usize) -> Option<Vec<u16>> {
        let mut inner = self.inner.lock();
        let pairs = inner.pairs;
        if pairs == 0 || pairs.saturating_sub(inner.reserved.len() / 2) < count {
            return None;
        }

        let mut picked = Vec::with_capacity(count);
        let mut slot = inner.cursor;
        for _ in 0..pairs {
            let rtp = inner.rtp_port(slot);
            if inner.pair_is_free(rtp) {
                picked.push(rtp);
                if picked.len() == count {
                    break;
                }
            }
            slot = (slot + 1) % pairs;
        }

        if picked.len() < count {
            return None;
        }
        inner.cursor = (slot + 1) % pairs;
        for rtp in &picked {
            inner.reserved.insert(*rtp);
            inner.reserved.insert(rtp + 1);
        }
        Some(picked)
    }
}

fn bindable(port: u16) -> bool {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Ports held by one session; returned to the pool exactly once, either by
/// [`PortReservation::release`] or on drop
pub struct PortReservation {
    ports: Vec<u16>,
    pool: Arc<Mutex<PoolInner>>,
    released: AtomicBool,
}

impl PortReservation {
    /// The RTP ports; `port + 1` of each is held for RTCP
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Return the ports. Returns `false` if they had already been returned.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut inner = self.pool.lock();
        for rtp in &self.ports {
            inner.reserved.remove(rtp);
            inner.reserved.remove(&(rtp + 1));
        }
        debug!(ports = ?self.ports, "released local ports");
        true
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReservation")
            .field("ports", &self.ports)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(start: u16, end: u16) -> PortPool {
        PortPool::new(&PortConfig {
            range_start: start,
            range_end: end,
            reserve_timeout_ms: 200,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let pool = pool(47100, 47119);
        let res = pool.reserve(2).await.unwrap();
        assert_eq!(res.ports().len(), 2);
        assert_ne!(res.get(0), res.get(1));
        // two RTP ports plus their RTCP neighbours
        assert_eq!(pool.in_use(), 4);

        assert!(res.release());
        assert_eq!(pool.in_use(), 0);
        // second release is a no-op
        assert!(!res.release());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let pool = pool(47120, 47139);
        {
            let _res = pool.reserve(3).await.unwrap();
            assert_eq!(pool.in_use(), 6);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_reservations_are_disjoint() {
        let pool = pool(47140, 47159);
        let a = pool.reserve(2).await.unwrap();
        let b = pool.reserve(2).await.unwrap();
        for port in a.ports() {
            assert!(!b.ports().contains(port));
        }
        assert_eq!(pool.in_use(), 8);
    }

    #[tokio::test]
    async fn test_rtcp_neighbours_never_collide() {
        let pool = pool(47180, 47199);
        let a = pool.reserve(2).await.unwrap();
        let b = pool.reserve(2).await.unwrap();

        let rtp: Vec<u16> = a.ports().iter().chain(b.ports()).copied().collect();
        for port in &rtp {
            assert_eq!(port % 2, 0, "RTP port {} is odd", port);
            assert!(
                !rtp.contains(&(port + 1)),
                "RTCP port of {} is another RTP port",
                port
            );
        }
        let mut held: Vec<u16> = rtp.iter().flat_map(|p| [*p, p + 1]).collect();
        held.sort_unstable();
        held.dedup();
        assert_eq!(held.len(), 8);
        assert_eq!(pool.in_use(), 8);
    }

    #[tokio::test]
    async fn test_odd_range_start_is_aligned() {
        let pool = pool(47201, 47206);
        let res = pool.reserve(2).await.unwrap();
        assert_eq!(res.ports(), &[47202, 47204]);
        // 47206 has no RTCP neighbour inside the range
        let err = pool
            .reserve_within(1, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortsExhausted(_)));
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = pool(47160, 47161);
        let _held = pool.reserve(1).await.unwrap();
        let err = pool
            .reserve_within(1, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortsExhausted(_)));
    }

    #[tokio::test]
    async fn test_waiting_reservation_succeeds_after_release() {
        let pool = pool(47162, 47165);
        let held = pool.reserve(2).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve_within(2, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release();

        let res = waiter.await.unwrap().unwrap();
        assert_eq!(res.ports().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_pairs_bound_elsewhere() {
        let pool = pool(47170, 47175);
        // the RTCP half of the first pair is taken
        let _blocker = UdpSocket::bind((Ipv4Addr::LOCALHOST, 47171)).unwrap();
        let res = pool.reserve(2).await.unwrap();
        assert_eq!(res.ports(), &[47172, 47174]);
    }
}
