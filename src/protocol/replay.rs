//! Sliding-window replay protection for received counters

use crate::error::ProtocolError;

/// Number of counters tracked behind the highest one seen
pub const WINDOW_SIZE: u64 = 2048;

const WORD_BITS: u64 = 64;
const WORDS: usize = (WINDOW_SIZE / WORD_BITS) as usize;

/// Ring bitmap of recently received counters.
///
/// [`check`](Self::check) and [`mark`](Self::mark) are split so a counter is
/// only recorded after its packet has authenticated; a forged packet must
/// not be able to burn a counter.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: [u64; WORDS],
    greatest: u64,
    seen_any: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            greatest: 0,
            seen_any: false,
        }
    }

    /// Highest counter marked so far
    pub fn greatest(&self) -> Option<u64> {
        self.seen_any.then_some(self.greatest)
    }

    /// Would `counter` be accepted?
    pub fn check(&self, counter: u64) -> Result<(), ProtocolError> {
        if !self.seen_any || counter > self.greatest {
            return Ok(());
        }
        if self.greatest - counter >= WINDOW_SIZE || self.is_set(counter) {
            return Err(ProtocolError::ReplayDetected { counter });
        }
        Ok(())
    }

    /// Record an authenticated counter
    pub fn mark(&mut self, counter: u64) {
        if self.seen_any && counter <= self.greatest {
            self.set(counter);
            return;
        }

        if self.seen_any {
            let advance = counter - self.greatest;
            if advance >= WINDOW_SIZE {
                self.bitmap = [0; WORDS];
            } else {
                for c in self.greatest + 1..counter {
                    self.clear(c);
                }
            }
        }

        self.greatest = counter;
        self.seen_any = true;
        self.set(counter);
    }

    fn slot(counter: u64) -> (usize, u64) {
        let bit = counter % WINDOW_SIZE;
        ((bit / WORD_BITS) as usize, 1u64 << (bit % WORD_BITS))
    }

    fn is_set(&self, counter: u64) -> bool {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] & mask != 0
    }

    fn set(&mut self, counter: u64) {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] |= mask;
    }

    fn clear(&mut self, counter: u64) {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(window: &mut ReplayWindow, counter: u64) -> bool {
        if window.check(counter).is_err() {
            return false;
        }
        window.mark(counter);
        true
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 0));
        assert!(!accept(&mut window, 0));
        assert!(accept(&mut window, 1));
        assert!(!accept(&mut window, 1));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 10));
        assert!(accept(&mut window, 5));
        assert!(accept(&mut window, 7));
        assert!(!accept(&mut window, 5));
        assert_eq!(window.greatest(), Some(10));
    }

    #[test]
    fn test_below_window_rejected() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, WINDOW_SIZE + 100));
        assert!(!accept(&mut window, 100));
        assert!(accept(&mut window, 101));
    }

    #[test]
    fn test_unmarked_counter_still_accepted() {
        let mut window = ReplayWindow::new();
        window.mark(3);
        assert!(window.check(4).is_ok());
        // check alone must not record anything
        assert!(window.check(4).is_ok());
    }

    #[test]
    fn test_large_jump_clears_history() {
        let mut window = ReplayWindow::new();
        for c in 0..64 {
            assert!(accept(&mut window, c));
        }
        let far = 10 * WINDOW_SIZE;
        assert!(accept(&mut window, far));
        // shares a slot with the old counter 6, which the jump wiped
        assert!(accept(&mut window, far - WINDOW_SIZE + 6));
        assert!(!accept(&mut window, 5));
    }

    #[test]
    fn test_advance_clears_reused_slots() {
        let mut window = ReplayWindow::new();
        assert!(accept(&mut window, 1));
        assert!(accept(&mut window, WINDOW_SIZE));
        // counter WINDOW_SIZE + 1 shares a slot with 1 and must not be
        // mistaken for a replay
        assert!(accept(&mut window, WINDOW_SIZE + 1));
    }
}
