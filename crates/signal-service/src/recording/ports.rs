//! Muxer-side UDP port allocation for recording streams.
//!
//! Each recorded stream needs an RTP/RTCP port pair on the muxer side,
//! drawn from a fixed ephemeral range. Pairs are tracked while held so
//! two concurrent recordings can never be told to target the same port.

use crate::errors::SignalError;

use rand::Rng;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// An RTP/RTCP port pair held by one recorded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Allocator over the configured recording port range.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `[min, max]`.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate an RTP/RTCP pair, random within the range.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Recording`] when the range is exhausted.
    pub async fn allocate_pair(&self) -> Result<PortPair, SignalError> {
        let mut in_use = self.in_use.lock().await;

        let rtp = Self::draw(self.min, self.max, &in_use)?;
        in_use.insert(rtp);
        let rtcp = match Self::draw(self.min, self.max, &in_use) {
            Ok(port) => port,
            Err(e) => {
                in_use.remove(&rtp);
                return Err(e);
            }
        };
        in_use.insert(rtcp);

        Ok(PortPair { rtp, rtcp })
    }

    /// Return a pair to the range. Releasing an already-free pair is a
    /// no-op.
    pub async fn release_pair(&self, pair: PortPair) {
        let mut in_use = self.in_use.lock().await;
        in_use.remove(&pair.rtp);
        in_use.remove(&pair.rtcp);
    }

    /// Number of ports currently held.
    pub async fn in_use(&self) -> usize {
        self.in_use.lock().await.len()
    }

    fn draw(min: u16, max: u16, in_use: &HashSet<u16>) -> Result<u16, SignalError> {
        let span = usize::from(max - min) + 1;
        if in_use.len() >= span {
            return Err(SignalError::Recording(format!(
                "recording port range {min}-{max} exhausted"
            )));
        }

        // Random draws first, then a linear sweep so exhaustion-adjacent
        // states still terminate.
        let mut rng = rand::thread_rng();
        for _ in 0..span * 2 {
            let candidate = rng.gen_range(min..=max);
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
        (min..=max)
            .find(|p| !in_use.contains(p))
            .ok_or_else(|| {
                SignalError::Recording(format!("recording port range {min}-{max} exhausted"))
            })
    }
}
