use std::time::Instant;

use omx_api::event::{WaitParam, WaitStatus};

use crate::counter::Counter;
use crate::eventq::{EventQueues, Waiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Timeout,
    Progress,
}

impl EventQueues {
    /// Sleeps until an event is published, a deadline passes or `interrupt` is
    /// called.
    ///
    /// Returns `Race` right away if the caller's positions are already stale, that
    /// is an event was published since the caller last looked at the rings. Of the
    /// caller's deadline and the progress deadline, the earliest is armed.
    pub fn wait_event(&self, param: &WaitParam) -> WaitStatus {
        let mut desc = self.lock_desc();

        let cursors = desc.cursors;
        if param.next_exp_index != cursors.next_exp
            || param.next_unexp_index != cursors.next_reserved_unexp
        {
            tracing::trace!(
                "wait event race ({},{}) != ({},{})",
                param.next_exp_index,
                param.next_unexp_index,
                cursors.next_exp,
                cursors.next_reserved_unexp
            );
            self.counters.inc(Counter::WaitRace);
            return WaitStatus::Race;
        }

        let id = desc.next_waiter_id;
        desc.next_waiter_id += 1;
        desc.waiters.push(Waiter {
            id,
            status: WaitStatus::None,
        });

        let mut timer = param.deadline.map(|d| (d, TimerKind::Timeout));
        if let Some(wakeup) = desc.wakeup_deadline {
            if timer.map_or(true, |(d, _)| wakeup < d) {
                timer = Some((wakeup, TimerKind::Progress));
            }
        }

        let mut status = match timer {
            Some((deadline, _)) if Instant::now() >= deadline => {
                tracing::trace!("wait event deadline has passed, not sleeping");
                WaitStatus::Race
            }
            _ => WaitStatus::None,
        };

        if status == WaitStatus::None {
            self.counters.inc(Counter::WaitSleep);
            loop {
                let current = desc
                    .waiters
                    .iter()
                    .find(|w| w.id == id)
                    .map(|w| w.status)
                    .unwrap_or(WaitStatus::Intr);
                if current != WaitStatus::None {
                    status = current;
                    break;
                }
                match timer {
                    None => {
                        desc = self.cond.wait(desc).unwrap_or_else(|e| e.into_inner());
                    }
                    Some((deadline, kind)) => {
                        let now = Instant::now();
                        if now >= deadline {
                            status = match kind {
                                TimerKind::Timeout => WaitStatus::Timeout,
                                TimerKind::Progress => WaitStatus::Progress,
                            };
                            break;
                        }
                        desc = self
                            .cond
                            .wait_timeout(desc, deadline - now)
                            .map(|(guard, _)| guard)
                            .unwrap_or_else(|e| e.into_inner().0);
                    }
                }
            }
        }

        desc.waiters.retain(|w| w.id != id);
        if status == WaitStatus::None {
            status = WaitStatus::Intr;
        }
        if status == WaitStatus::Intr {
            self.counters.inc(Counter::WaitIntr);
        }
        status
    }

    /// Wakes every sleeping waiter with `Intr`.
    pub fn interrupt(&self) {
        let mut desc = self.lock_desc();
        for waiter in desc.waiters.iter_mut() {
            if waiter.status == WaitStatus::None {
                waiter.status = WaitStatus::Intr;
            }
        }
        self.cond.notify_all();
    }

    pub fn waiters(&self) -> usize {
        self.lock_desc().waiters.len()
    }
}
