//! Port allocation for cache runtimes.
//!
//! Runtimes expose services on node ports taken from one cluster-wide range.
//! This library keeps the allocation table for that range:
//! - Range parsing (`20000-25000`)
//! - A bitmap of taken ports plus the holder of each allocated port
//! - Pluggable selection strategies (lowest-free bitmap scan, random draw)
//! - Recovery helpers (`restore`, `reserve`) used before serving allocations
//!
//! # Invariants
//!
//! - A port is held by at most one holder at a time
//! - `allocate` is all-or-nothing
//! - `release` is idempotent

mod strategy;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub use strategy::{AllocationStrategy, BitmapStrategy, RandomStrategy, DEFAULT_RANDOM_ATTEMPTS};

/// Port allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The configured range could not be parsed or is empty.
    #[error("invalid port range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    /// Fewer free ports remain than were requested.
    #[error("port range {range} exhausted: requested {requested}, available {available}")]
    ExhaustedRange {
        range: String,
        requested: usize,
        available: usize,
    },

    /// A port being restored is already held by someone else.
    #[error("port {port} is already held by {holder}")]
    AlreadyHeld { port: u16, holder: String },

    /// The allocation policy name is not known.
    #[error("unknown port allocate policy '{0}' (expected bitmap or random)")]
    UnknownPolicy(String),
}

impl PortError {
    /// Returns true if the range ran out of ports.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::ExhaustedRange { .. })
    }
}

// ============================================================================
// Port Range
// ============================================================================

/// Contiguous range of ports `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base: u16,
    size: u32,
}

impl PortRange {
    /// Create a range of `size` ports starting at `base`.
    pub fn new(base: u16, size: u32) -> Result<Self, PortError> {
        let invalid = |reason: &str| PortError::InvalidRange {
            input: format!("{}+{}", base, size),
            reason: reason.to_string(),
        };

        if size == 0 {
            return Err(invalid("range must contain at least one port"));
        }
        if u32::from(base) + size - 1 > u32::from(u16::MAX) {
            return Err(invalid("range extends past port 65535"));
        }

        Ok(Self { base, size })
    }

    /// Parse `min-max` (both inclusive) or a single port.
    pub fn parse(s: &str) -> Result<Self, PortError> {
        let invalid = |reason: &str| PortError::InvalidRange {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty"));
        }

        let (low, high) = match s.split_once('-') {
            Some((low, high)) => (low.trim(), high.trim()),
            None => (s, s),
        };

        let low: u16 = low.parse().map_err(|_| invalid("lower bound is not a port"))?;
        let high: u16 = high
            .parse()
            .map_err(|_| invalid("upper bound is not a port"))?;

        if high < low {
            return Err(invalid("upper bound is below lower bound"));
        }

        Self::new(low, u32::from(high) - u32::from(low) + 1).map_err(|_| invalid("out of bounds"))
    }

    /// First port in the range.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Last port in the range (inclusive).
    pub fn last(&self) -> u16 {
        (u32::from(self.base) + self.size - 1) as u16
    }

    /// Check if a port is within the range.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && port <= self.last()
    }

    fn offset_of(&self, port: u16) -> Option<usize> {
        self.contains(port).then(|| usize::from(port - self.base))
    }

    fn port_at(&self, offset: usize) -> u16 {
        (u32::from(self.base) + offset as u32) as u16
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Bitmap
// ============================================================================

/// One bit per port in the range; a set bit means taken.
#[derive(Debug, Clone)]
pub struct PortBitmap {
    range: PortRange,
    words: Vec<u64>,
    taken: usize,
}

impl PortBitmap {
    /// Create an empty bitmap for a range.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            words: vec![0; range.size().div_ceil(64)],
            taken: 0,
        }
    }

    /// The range covered by this bitmap.
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Check if a port is in range and not taken.
    pub fn is_free(&self, port: u16) -> bool {
        match self.range.offset_of(port) {
            Some(offset) => !self.bit(offset),
            None => false,
        }
    }

    /// Number of free ports.
    pub fn free_count(&self) -> usize {
        self.range.size() - self.taken
    }

    /// Free ports in offset order, starting at `start` and wrapping around.
    pub fn free_ports_from(&self, start: usize) -> impl Iterator<Item = u16> + '_ {
        let size = self.range.size();
        (0..size)
            .map(move |i| (start + i) % size)
            .filter(move |&offset| !self.bit(offset))
            .map(move |offset| self.range.port_at(offset))
    }

    /// Port at a given offset within the range.
    pub fn port_at(&self, offset: usize) -> u16 {
        self.range.port_at(offset % self.range.size())
    }

    fn bit(&self, offset: usize) -> bool {
        self.words[offset / 64] & (1u64 << (offset % 64)) != 0
    }

    /// Mark a port taken. Returns false if it was already taken or out of range.
    fn mark(&mut self, port: u16) -> bool {
        let Some(offset) = self.range.offset_of(port) else {
            return false;
        };
        if self.bit(offset) {
            return false;
        }
        self.words[offset / 64] |= 1u64 << (offset % 64);
        self.taken += 1;
        true
    }

    /// Mark a port free. Returns false if it was not taken.
    fn unmark(&mut self, port: u16) -> bool {
        let Some(offset) = self.range.offset_of(port) else {
            return false;
        };
        if !self.bit(offset) {
            return false;
        }
        self.words[offset / 64] &= !(1u64 << (offset % 64));
        self.taken -= 1;
        true
    }
}

// ============================================================================
// Allocation Policy
// ============================================================================

/// Named selection policy, as configured on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatePolicy {
    /// Lowest free ports first.
    Bitmap,
    /// Uniformly random free ports.
    #[default]
    Random,
}

impl AllocatePolicy {
    /// Policy name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bitmap => "bitmap",
            Self::Random => "random",
        }
    }

    /// Build the strategy implementing this policy.
    pub fn strategy(&self) -> Box<dyn AllocationStrategy> {
        match self {
            Self::Bitmap => Box::new(BitmapStrategy),
            Self::Random => Box::new(RandomStrategy::new()),
        }
    }
}

impl fmt::Display for AllocatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocatePolicy {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bitmap" => Ok(Self::Bitmap),
            "random" => Ok(Self::Random),
            other => Err(PortError::UnknownPolicy(other.to_string())),
        }
    }
}

// ============================================================================
// Allocator
// ============================================================================

struct AllocatorState<K> {
    bitmap: PortBitmap,
    holders: BTreeMap<u16, K>,
    reserved: BTreeSet<u16>,
    strategy: Box<dyn AllocationStrategy>,
}

/// Thread-safe port allocator keyed by holder.
///
/// The table lock is held only while the table is read or updated.
pub struct PortAllocator<K> {
    range: PortRange,
    policy: &'static str,
    state: Mutex<AllocatorState<K>>,
}

impl<K> PortAllocator<K>
where
    K: Clone + Eq + fmt::Display,
{
    /// Create an allocator over `range` using the given strategy.
    pub fn new(range: PortRange, strategy: Box<dyn AllocationStrategy>) -> Self {
        let policy = strategy.name();
        Self {
            range,
            policy,
            state: Mutex::new(AllocatorState {
                bitmap: PortBitmap::new(range),
                holders: BTreeMap::new(),
                reserved: BTreeSet::new(),
                strategy,
            }),
        }
    }

    /// Create an allocator for a named policy.
    pub fn with_policy(range: PortRange, policy: AllocatePolicy) -> Self {
        Self::new(range, policy.strategy())
    }

    /// The configured range.
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Name of the selection strategy.
    pub fn policy(&self) -> &'static str {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclude ports from allocation without assigning them to a holder.
    ///
    /// Ports outside the range or already taken are skipped. Returns the
    /// number of ports newly reserved.
    pub fn reserve<I>(&self, ports: I) -> usize
    where
        I: IntoIterator<Item = u16>,
    {
        let mut state = self.lock();
        let mut reserved = 0;
        for port in ports {
            if state.bitmap.mark(port) {
                state.reserved.insert(port);
                reserved += 1;
            }
        }
        reserved
    }

    /// Re-mark ports a holder already owns (e.g. read back from persisted state).
    ///
    /// Ports outside the range are ignored. Fails without changing anything if
    /// any port is reserved or held by a different holder. Restoring ports the
    /// holder already owns is a no-op. Returns the number of ports in range.
    pub fn restore(&self, holder: &K, ports: &[u16]) -> Result<usize, PortError> {
        let mut state = self.lock();

        let in_range: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|port| self.range.contains(*port))
            .collect();

        for port in &in_range {
            if state.reserved.contains(port) {
                return Err(PortError::AlreadyHeld {
                    port: *port,
                    holder: "<reserved>".to_string(),
                });
            }
            if let Some(existing) = state.holders.get(port) {
                if existing != holder {
                    return Err(PortError::AlreadyHeld {
                        port: *port,
                        holder: existing.to_string(),
                    });
                }
            }
        }

        for port in &in_range {
            if state.bitmap.mark(*port) {
                state.holders.insert(*port, holder.clone());
            }
        }

        Ok(in_range.len())
    }

    /// Re-mark whichever of `ports` are still free to `holder`.
    ///
    /// Unlike [`restore`](Self::restore), a conflict does not drop the rest:
    /// every in-range port not reserved or held by someone else is marked
    /// held. Returns the conflicting ports; out-of-range ports are ignored.
    pub fn restore_available(&self, holder: &K, ports: &[u16]) -> Vec<u16> {
        let mut state = self.lock();
        let mut conflicts = Vec::new();

        for port in ports.iter().copied().filter(|port| self.range.contains(*port)) {
            let owned = match state.holders.get(&port) {
                Some(existing) => existing == holder,
                None => state.bitmap.is_free(port),
            };
            if !owned {
                conflicts.push(port);
                continue;
            }
            if state.bitmap.mark(port) {
                state.holders.insert(port, holder.clone());
            }
        }

        conflicts
    }

    /// Allocate `count` distinct free ports to `holder`.
    pub fn allocate(&self, holder: &K, count: usize) -> Result<Vec<u16>, PortError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.lock();
        let available = state.bitmap.free_count();
        if available < count {
            return Err(PortError::ExhaustedRange {
                range: self.range.to_string(),
                requested: count,
                available,
            });
        }

        let AllocatorState {
            bitmap,
            holders,
            strategy,
            ..
        } = &mut *state;

        let mut ports = strategy.select(bitmap, count);
        ports.sort_unstable();
        ports.dedup();

        if ports.len() != count || ports.iter().any(|port| !bitmap.is_free(*port)) {
            // A strategy must only return free ports; fall back to a plain scan.
            ports = bitmap.free_ports_from(0).take(count).collect();
        }

        for port in &ports {
            bitmap.mark(*port);
            holders.insert(*port, holder.clone());
        }

        Ok(ports)
    }

    /// Release every port held by `holder`. Returns the released ports.
    pub fn release(&self, holder: &K) -> Vec<u16> {
        let mut state = self.lock();
        let released: Vec<u16> = state
            .holders
            .iter()
            .filter(|(_, h)| *h == holder)
            .map(|(port, _)| *port)
            .collect();

        for port in &released {
            state.holders.remove(port);
            state.bitmap.unmark(*port);
        }

        released
    }

    /// Ports currently held by `holder`, ascending.
    pub fn held_by(&self, holder: &K) -> Vec<u16> {
        self.lock()
            .holders
            .iter()
            .filter(|(_, h)| *h == holder)
            .map(|(port, _)| *port)
            .collect()
    }

    /// Current holder of a port, if any.
    pub fn holder_of(&self, port: u16) -> Option<K> {
        self.lock().holders.get(&port).cloned()
    }

    /// Check if a port is reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().reserved.contains(&port)
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.lock().bitmap.free_count()
    }
}

impl<K> fmt::Debug for PortAllocator<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn bitmap_allocator(base: u16, size: u32) -> PortAllocator<String> {
        PortAllocator::with_policy(PortRange::new(base, size).unwrap(), AllocatePolicy::Bitmap)
    }

    #[test]
    fn test_port_range_parse() {
        let range = PortRange::parse("20000-25000").unwrap();
        assert_eq!(range.base(), 20000);
        assert_eq!(range.last(), 25000);
        assert_eq!(range.size(), 5001);
        assert_eq!(range.to_string(), "20000-25000");

        let single = PortRange::parse("8080").unwrap();
        assert_eq!(single.size(), 1);

        assert!(PortRange::parse("").is_err());
        assert!(PortRange::parse("25000-20000").is_err());
        assert!(PortRange::parse("20000-70000").is_err());
        assert!(PortRange::parse("abc-def").is_err());
    }

    #[test]
    fn test_port_range_bounds() {
        assert!(PortRange::new(65535, 1).is_ok());
        assert!(PortRange::new(65535, 2).is_err());
        assert!(PortRange::new(1000, 0).is_err());

        let range = PortRange::new(20000, 10).unwrap();
        assert!(range.contains(20000));
        assert!(range.contains(20009));
        assert!(!range.contains(20010));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("bitmap".parse::<AllocatePolicy>().unwrap(), AllocatePolicy::Bitmap);
        assert_eq!("Random".parse::<AllocatePolicy>().unwrap(), AllocatePolicy::Random);
        assert!(matches!(
            "roundrobin".parse::<AllocatePolicy>(),
            Err(PortError::UnknownPolicy(_))
        ));
        assert_eq!(AllocatePolicy::default(), AllocatePolicy::Random);
    }

    #[test]
    fn test_bitmap_allocates_lowest_first() {
        let allocator = bitmap_allocator(20000, 10);
        let a = "default/a".to_string();
        let b = "default/b".to_string();

        assert_eq!(allocator.allocate(&a, 2).unwrap(), vec![20000, 20001]);
        assert_eq!(allocator.allocate(&b, 1).unwrap(), vec![20002]);

        allocator.release(&a);
        assert_eq!(allocator.allocate(&b, 1).unwrap(), vec![20000]);
        assert_eq!(allocator.held_by(&b), vec![20000, 20002]);
    }

    #[test]
    fn test_exhausted_range() {
        let allocator = bitmap_allocator(20000, 10);
        let holder = "default/a".to_string();

        let err = allocator.allocate(&holder, 11).unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(allocator.available(), 10);

        allocator.allocate(&holder, 10).unwrap();
        let err = allocator.allocate(&holder, 1).unwrap_err();
        assert_eq!(
            err,
            PortError::ExhaustedRange {
                range: "20000-20009".to_string(),
                requested: 1,
                available: 0
            }
        );
    }

    #[test]
    fn test_release_idempotent() {
        let allocator = bitmap_allocator(20000, 4);
        let holder = "default/a".to_string();

        allocator.allocate(&holder, 3).unwrap();
        assert_eq!(allocator.release(&holder), vec![20000, 20001, 20002]);
        assert!(allocator.release(&holder).is_empty());
        assert_eq!(allocator.available(), 4);
    }

    #[test]
    fn test_reserve_excludes_ports() {
        let allocator = bitmap_allocator(20000, 4);
        assert_eq!(allocator.reserve([20000, 20002, 30000]), 2);
        assert!(allocator.is_reserved(20000));

        let holder = "default/a".to_string();
        assert_eq!(allocator.allocate(&holder, 2).unwrap(), vec![20001, 20003]);
        assert!(allocator.allocate(&holder, 1).unwrap_err().is_exhausted());
    }

    #[test]
    fn test_restore_available_keeps_free_ports() {
        let allocator = bitmap_allocator(20000, 10);
        let a = "default/a".to_string();
        let b = "default/b".to_string();
        allocator.restore(&a, &[20000, 20001]).unwrap();
        allocator.reserve([20003]);

        let conflicts = allocator.restore_available(&b, &[20001, 20002, 20003, 30000]);
        assert_eq!(conflicts, vec![20001, 20003]);
        assert_eq!(allocator.holder_of(20001), Some(a.clone()));
        assert_eq!(allocator.holder_of(20002), Some(b.clone()));
        assert!(allocator.is_reserved(20003));

        // Repeating it for the same holder changes nothing.
        assert_eq!(allocator.restore_available(&b, &[20002]), Vec::<u16>::new());
        assert_eq!(allocator.held_by(&b), vec![20002]);
        assert_eq!(allocator.available(), 6);
    }

    #[test]
    fn test_restore_marks_ports_held() {
        let allocator = bitmap_allocator(20000, 10);
        let a = "default/a".to_string();
        let b = "default/b".to_string();

        assert_eq!(allocator.restore(&a, &[20000, 20001, 40000]).unwrap(), 2);
        assert_eq!(allocator.holder_of(20000), Some(a.clone()));

        // Restoring again for the same holder is a no-op.
        assert_eq!(allocator.restore(&a, &[20000]).unwrap(), 1);
        assert_eq!(allocator.available(), 8);

        let err = allocator.restore(&b, &[20005, 20001]).unwrap_err();
        assert!(matches!(err, PortError::AlreadyHeld { port: 20001, .. }));
        // Nothing from the failed restore is applied.
        assert_eq!(allocator.holder_of(20005), None);

        assert_eq!(allocator.allocate(&b, 2).unwrap(), vec![20002, 20003]);
    }

    #[test]
    fn test_restore_rejects_reserved() {
        let allocator = bitmap_allocator(20000, 10);
        allocator.reserve([20003]);
        assert!(allocator.restore(&"default/a".to_string(), &[20003]).is_err());
    }

    #[test]
    fn test_random_allocations_are_distinct() {
        let allocator: PortAllocator<String> = PortAllocator::new(
            PortRange::new(20000, 16).unwrap(),
            Box::new(RandomStrategy::seeded(7)),
        );
        allocator.reserve([20004, 20005]);

        let mut seen = BTreeSet::new();
        for i in 0..7 {
            let holder = format!("default/r{}", i);
            for port in allocator.allocate(&holder, 2).unwrap() {
                assert!(!allocator.is_reserved(port));
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(allocator.available(), 0);
        assert!(allocator
            .allocate(&"default/late".to_string(), 1)
            .unwrap_err()
            .is_exhausted());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate { holder: u8, count: usize },
        Release { holder: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0usize..5).prop_map(|(holder, count)| Op::Allocate { holder, count }),
            (0u8..6).prop_map(|holder| Op::Release { holder }),
        ]
    }

    proptest! {
        #[test]
        fn prop_no_port_held_twice(
            ops in proptest::collection::vec(op_strategy(), 1..60),
            random in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let range = PortRange::new(30000, 12).unwrap();
            let strategy: Box<dyn AllocationStrategy> = if random {
                Box::new(RandomStrategy::seeded(seed))
            } else {
                Box::new(BitmapStrategy)
            };
            let allocator: PortAllocator<String> = PortAllocator::new(range, strategy);
            let mut model: HashMap<u16, String> = HashMap::new();

            for op in ops {
                match op {
                    Op::Allocate { holder, count } => {
                        let holder = format!("ns/h{}", holder);
                        let free = range.size() - model.len();
                        match allocator.allocate(&holder, count) {
                            Ok(ports) => {
                                prop_assert!(count <= free);
                                prop_assert_eq!(ports.len(), count);
                                for port in ports {
                                    prop_assert!(range.contains(port));
                                    prop_assert!(model.insert(port, holder.clone()).is_none());
                                }
                            }
                            Err(err) => {
                                prop_assert!(err.is_exhausted());
                                prop_assert!(count > free);
                            }
                        }
                    }
                    Op::Release { holder } => {
                        let holder = format!("ns/h{}", holder);
                        for port in allocator.release(&holder) {
                            prop_assert_eq!(model.remove(&port), Some(holder.clone()));
                        }
                        prop_assert!(model.values().all(|h| *h != holder));
                    }
                }
                prop_assert_eq!(allocator.available(), range.size() - model.len());
            }

            let size = range.size();
            prop_assert!(allocator.allocate(&"ns/overflow".to_string(), size + 1).unwrap_err().is_exhausted());
        }
    }
}
