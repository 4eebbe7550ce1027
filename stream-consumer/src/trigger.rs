use std::sync::atomic::{AtomicU32, Ordering};

/// Fires once every `threshold` spins. Used to force a periodic reclaim sweep even when
/// reads keep returning entries.
///
/// A threshold of 0 never fires.
#[derive(Debug)]
pub struct CyclicTrigger {
    threshold: u32,
    position: AtomicU32,
}

impl CyclicTrigger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            position: AtomicU32::new(0),
        }
    }

    /// Advance by one. Returns true when this call completed a cycle, in which case the
    /// position is back to 0. Concurrent callers never both complete the same cycle.
    pub fn spin(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }

        let threshold = self.threshold;
        let previous = self
            .position
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |position| {
                if position + 1 >= threshold {
                    Some(0)
                } else {
                    Some(position + 1)
                }
            });

        match previous {
            Ok(position) => position + 1 >= threshold,
            Err(_) => false,
        }
    }

    pub fn reset(&self) {
        self.position.store(0, Ordering::Release);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fires_every_nth_spin() {
        let trigger = CyclicTrigger::new(3);
        let fired: Vec<bool> = (0..9).map(|_| trigger.spin()).collect();
        assert_eq!(
            fired,
            vec![false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn test_threshold_one_always_fires() {
        let trigger = CyclicTrigger::new(1);
        assert!((0..5).all(|_| trigger.spin()));
    }

    #[test]
    fn test_zero_threshold_never_fires() {
        let trigger = CyclicTrigger::new(0);
        assert!((0..100).all(|_| !trigger.spin()));
    }

    #[test]
    fn test_reset_restarts_the_cycle() {
        let trigger = CyclicTrigger::new(3);
        assert!(!trigger.spin());
        assert!(!trigger.spin());
        trigger.reset();
        assert!(!trigger.spin());
        assert!(!trigger.spin());
        assert!(trigger.spin());
    }

    #[test]
    fn test_concurrent_spins_fire_once_per_cycle() {
        let trigger = Arc::new(CyclicTrigger::new(7));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let trigger = trigger.clone();
                thread::spawn(move || (0..700).filter(|_| trigger.spin()).count())
            })
            .collect();

        let fired: usize = workers
            .into_iter()
            .map(|worker| worker.join().expect("spinning thread panicked"))
            .sum();
        assert_eq!(fired, 8 * 700 / 7);
    }
}
