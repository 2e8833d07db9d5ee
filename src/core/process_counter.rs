//! Admission limiter for parallel fan-outs.

/// Counts in-flight requests of one operation against a fixed bound.
///
/// `active` never exceeds `max_active`: [ProcessCounter::try_start] refuses instead.
#[derive(Debug, Clone)]
pub struct ProcessCounter {
    max_active: usize,
    active: usize,
}

impl ProcessCounter {
    pub fn new(max_active: usize) -> Self {
        ProcessCounter {
            max_active: max_active.max(1),
            active: 0,
        }
    }

    // === Getters ===

    #[cfg(test)]
    pub fn max_active(&self) -> usize {
        self.max_active
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn has_headroom(&self) -> bool {
        self.active < self.max_active
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0
    }

    // === Public Methods ===

    /// Take a slot, returns `false` if none is free.
    pub fn try_start(&mut self) -> bool {
        if !self.has_headroom() {
            return false;
        }

        self.active += 1;

        true
    }

    /// Release a slot.
    pub fn finish(&mut self) {
        self.active = self.active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_bound() {
        let mut counter = ProcessCounter::new(3);

        for round in 0..100 {
            // Interleave starts and finishes unevenly.
            for _ in 0..(round % 5) {
                counter.try_start();
                assert!(counter.active() <= counter.max_active());
            }
            for _ in 0..(round % 3) {
                counter.finish();
            }
        }

        while counter.try_start() {}
        assert_eq!(counter.active(), 3);
        assert!(!counter.has_headroom());
    }

    #[test]
    fn finish_saturates() {
        let mut counter = ProcessCounter::new(2);

        counter.finish();
        assert!(counter.is_idle());

        assert!(counter.try_start());
        assert!(counter.try_start());
        assert!(!counter.try_start());
        assert_eq!(counter.active(), 2);

        counter.finish();
        assert_eq!(counter.active(), 1);
        assert!(counter.try_start());
        assert!(!counter.has_headroom());
    }
}
