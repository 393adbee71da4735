use std::collections::BTreeMap;
use std::fmt;

pub type Tid = u32;

/// Fast-path size: a clock holds slots 0..VC_INIT_SIZE where slot i belongs
/// to tid i. Larger tids go in unreserved tail slots and take an O(n) scan.
/// None of the recommended test workloads create tids past this.
const VC_INIT_SIZE: usize = 8;
const_assert!(VC_INIT_SIZE > 0);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct Epoch {
    tid: Tid,
    timestamp: u32,
}

/// A map from tid to timestamp. Bottom is 0: a thread that was never
/// incremented in this clock reads as 0 and compares accordingly.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct VectorClock {
    v: Vec<Epoch>,
}

impl Default for VectorClock {
    fn default() -> VectorClock {
        VectorClock::new()
    }
}

impl VectorClock {
    pub fn new() -> VectorClock {
        let mut v = Vec::with_capacity(VC_INIT_SIZE);
        for i in 0..VC_INIT_SIZE {
            v.push(Epoch {
                tid: i as Tid,
                timestamp: 0,
            });
        }
        VectorClock { v }
    }

    fn find(&self, tid: Tid) -> Option<usize> {
        if (tid as usize) < VC_INIT_SIZE {
            debug_assert_eq!(self.v[tid as usize].tid, tid);
            return Some(tid as usize);
        }
        self.v[VC_INIT_SIZE..]
            .iter()
            .position(|e| e.tid == tid)
            .map(|i| i + VC_INIT_SIZE)
    }

    pub fn inc(&mut self, tid: Tid) {
        match self.find(tid) {
            Some(i) => self.v[i].timestamp += 1,
            None => self.v.push(Epoch { tid, timestamp: 1 }),
        }
    }

    pub fn get(&self, tid: Tid) -> u32 {
        match self.find(tid) {
            Some(i) => self.v[i].timestamp,
            None => 0,
        }
    }

    /// Pointwise max of the two clocks, stored into self.
    pub fn merge(&mut self, src: &VectorClock) {
        // anything we have, take the max with src's version
        for e in self.v.iter_mut() {
            let theirs = src.get(e.tid);
            if theirs > e.timestamp {
                e.timestamp = theirs;
            }
        }
        // anything we were missing, copy src's entry
        if src.v.len() > VC_INIT_SIZE {
            let missing: Vec<Epoch> = src.v[VC_INIT_SIZE..]
                .iter()
                .filter(|e| self.find(e.tid).is_none())
                .copied()
                .collect();
            self.v.extend(missing);
        }
    }

    /// True iff every timestamp in self is <= the matching timestamp in
    /// `after`. Equal timestamps do not break the ordering.
    pub fn happens_before(&self, after: &VectorClock) -> bool {
        // entries missing from self are bottom and compare fine automatically
        self.v.iter().all(|e| e.timestamp <= after.get(e.tid))
    }

    pub fn clock_eq(&self, other: &VectorClock) -> bool {
        self.v.iter().all(|e| e.timestamp == other.get(e.tid))
            && other.v.iter().all(|e| e.timestamp == self.get(e.tid))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.v.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}", e.tid, e.timestamp)?;
        }
        write!(f, "]")
    }
}

/// The clock each lock last saw at release time. Corresponds to "L" in the
/// fasttrack scheme; the per-thread "C" clocks live on the threads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockClocks {
    map: BTreeMap<u32, VectorClock>,
}

impl LockClocks {
    pub fn new() -> LockClocks {
        LockClocks {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn find(&self, lock_addr: u32) -> Option<&VectorClock> {
        self.map.get(&lock_addr)
    }

    pub fn set(&mut self, lock_addr: u32, clock: VectorClock) {
        self.map.insert(lock_addr, clock);
    }

    /// FT-acquire: pull the lock's release clock into the acquiring thread.
    pub fn acquire(&self, current_clock: &mut VectorClock, lock_addr: u32) {
        if let Some(clock) = self.find(lock_addr) {
            current_clock.merge(clock);
        }
    }

    /// FT-release: publish the releasing thread's clock on the lock, then
    /// step the releaser into its next epoch.
    pub fn release(&mut self, current_clock: &mut VectorClock, tid: Tid, lock_addr: u32) {
        self.set(lock_addr, current_clock.clone());
        current_clock.inc(tid);
    }
}
