use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Counter {
    ExpEventqFull,
    UnexpEventqFull,
    ExpEvents,
    UnexpEvents,
    WaitRace,
    WaitSleep,
    WaitIntr,
}

const COUNTER_NR: usize = Counter::WaitIntr as usize + 1;

impl Counter {
    pub const ALL: [Counter; COUNTER_NR] = [
        Counter::ExpEventqFull,
        Counter::UnexpEventqFull,
        Counter::ExpEvents,
        Counter::UnexpEvents,
        Counter::WaitRace,
        Counter::WaitSleep,
        Counter::WaitIntr,
    ];
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Counter::ExpEventqFull => "ExpEventQ Full",
            Counter::UnexpEventqFull => "UnexpEventQ Full",
            Counter::ExpEvents => "ExpEventQ Notified",
            Counter::UnexpEvents => "UnexpEventQ Notified",
            Counter::WaitRace => "Wait Race",
            Counter::WaitSleep => "Wait Sleep",
            Counter::WaitIntr => "Wait Interrupted",
        };
        f.write_str(s)
    }
}

/// Statistics of one endpoint's queues.
#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicU64; COUNTER_NR],
}

impl Counters {
    #[inline]
    pub fn inc(&self, counter: Counter) {
        self.values[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::ALL.iter().map(|&c| (c, self.get(c))).collect()
    }
}
