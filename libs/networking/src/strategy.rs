//! Port selection strategies.

use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::PortBitmap;

/// Random draws per requested port before falling back to a scan.
pub const DEFAULT_RANDOM_ATTEMPTS: usize = 16;

/// Picks free ports out of a bitmap.
///
/// The allocator checks the free count before calling `select`, so a strategy
/// may assume at least `count` ports are free.
pub trait AllocationStrategy: Send {
    /// Strategy name, as used on the command line.
    fn name(&self) -> &'static str;

    /// Choose `count` distinct free ports.
    fn select(&mut self, table: &PortBitmap, count: usize) -> Vec<u16>;
}

/// Lowest free ports first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitmapStrategy;

impl AllocationStrategy for BitmapStrategy {
    fn name(&self) -> &'static str {
        "bitmap"
    }

    fn select(&mut self, table: &PortBitmap, count: usize) -> Vec<u16> {
        table.free_ports_from(0).take(count).collect()
    }
}

/// Uniform random draws with a bounded number of attempts.
///
/// When probing keeps hitting taken ports (a nearly full range) the rest is
/// filled by a scan starting at a random offset.
pub struct RandomStrategy {
    rng: StdRng,
    max_attempts: usize,
}

impl RandomStrategy {
    /// Strategy seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            max_attempts: DEFAULT_RANDOM_ATTEMPTS,
        }
    }

    /// Deterministic strategy for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            max_attempts: DEFAULT_RANDOM_ATTEMPTS,
        }
    }

    /// Override the draw budget per requested port.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RandomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomStrategy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl AllocationStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&mut self, table: &PortBitmap, count: usize) -> Vec<u16> {
        let size = table.range().size();
        let mut picked = BTreeSet::new();
        let mut attempts = 0;
        let budget = self.max_attempts.saturating_mul(count);

        while picked.len() < count && attempts < budget {
            attempts += 1;
            let port = table.port_at(self.rng.random_range(0..size));
            if table.is_free(port) {
                picked.insert(port);
            }
        }

        if picked.len() < count {
            let start = self.rng.random_range(0..size);
            for port in table.free_ports_from(start) {
                if picked.len() == count {
                    break;
                }
                picked.insert(port);
            }
        }

        picked.into_iter().collect()
    }
}
