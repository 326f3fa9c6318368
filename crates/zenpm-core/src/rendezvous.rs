//! Cross-core rendezvous: run a callback on every logical core and wait.
//!
//! The hard concurrency in this crate is not task-based but cross-core.
//! A rendezvous blocks the initiating thread until every core in the
//! package has executed the supplied callback; within a round a callback
//! sees whatever register state was durably written by prior, completed
//! rounds. The barrier provides that full ordering, nothing finer.
//!
//! Two modes:
//! - [`RendezvousMode::Normal`] — callbacks run concurrently, one pinned
//!   thread per core. Used for the per-cycle telemetry refresh and P-state
//!   table writes.
//! - [`RendezvousMode::Exclusive`] — callbacks run strictly one core at a
//!   time in core order while every other participant holds at the barrier.
//!   Used only for one-time initialization, where interleaving during
//!   counter seeding would corrupt the baselines.
//!
//! No partial-failure semantics and no timeout: a stuck core blocks the
//! package (inherited platform risk). The callback consults its
//! [`CoreRole`] to decide what to do; a core whose role cannot be
//! determined participates in the barriers but performs no work.

use std::sync::Barrier;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::topology::{CoreRole, CoreTopology};

/// Interrupt posture of a rendezvous round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousMode {
    /// Callbacks on all cores concurrently.
    Normal,
    /// Callbacks serialized in core order, no interleaving.
    Exclusive,
}

/// Execute `f` on every logical core of the package and block until all
/// participants have finished.
pub fn run_on_all_cores<F>(topology: &CoreTopology, mode: RendezvousMode, f: F)
where
    F: Fn(&CoreRole) + Sync,
{
    let n = topology.logical_count() as usize;
    let entry = Barrier::new(n);
    let exit = Barrier::new(n);
    let turn = AtomicU32::new(0);
    let f = &f;

    std::thread::scope(|s| {
        for logical in 0..topology.logical_count() {
            let entry = &entry;
            let exit = &exit;
            let turn = &turn;
            s.spawn(move || {
                pin_to_core(logical);
                let role = topology.role_of(logical);
                entry.wait();
                match mode {
                    RendezvousMode::Normal => {
                        if let Some(role) = &role {
                            f(role);
                        }
                    }
                    RendezvousMode::Exclusive => {
                        while turn.load(Ordering::Acquire) != logical {
                            std::hint::spin_loop();
                        }
                        if let Some(role) = &role {
                            f(role);
                        }
                        turn.store(logical + 1, Ordering::Release);
                    }
                }
                exit.wait();
            });
        }
    });
}

/// Pin the calling thread to one logical core. Best effort: telemetry from
/// an unpinned thread is merely less accurate, never unsafe, since each
/// callback addresses registers by explicit core id.
#[cfg(target_os = "linux")]
fn pin_to_core(logical: u32) {
    // SAFETY: cpu_set_t is POD; the syscall only inspects the set.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(logical as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_logical: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn every_core_runs_once() {
        let topo = CoreTopology::new(2, 4);
        let seen = Mutex::new(Vec::new());
        run_on_all_cores(&topo, RendezvousMode::Normal, |role| {
            seen.lock().unwrap().push(role.logical);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn exclusive_mode_never_interleaves() {
        let topo = CoreTopology::new(4, 8);
        let inside = AtomicBool::new(false);
        let overlaps = AtomicUsize::new(0);
        run_on_all_cores(&topo, RendezvousMode::Exclusive, |_role| {
            if inside.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
            inside.store(false, Ordering::SeqCst);
        });
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exclusive_mode_runs_in_core_order() {
        let topo = CoreTopology::new(3, 6);
        let order = Mutex::new(Vec::new());
        run_on_all_cores(&topo, RendezvousMode::Exclusive, |role| {
            order.lock().unwrap().push(role.logical);
        });
        assert_eq!(order.into_inner().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn caller_blocks_until_round_completes() {
        let topo = CoreTopology::new(2, 2);
        let done = AtomicUsize::new(0);
        run_on_all_cores(&topo, RendezvousMode::Normal, |_role| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            done.fetch_add(1, Ordering::SeqCst);
        });
        // Returning from the rendezvous implies all callbacks finished.
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
