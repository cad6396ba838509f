use std::cell::Cell;

/// Watermark-based flow control for one side of a node.
///
/// Backpressure turns on when the buffered amount reaches the high
/// watermark and turns off again once it falls to the low watermark.
/// A writable side uses the release edge to emit `drain`; a readable
/// side only asks whether there is room below the high watermark.
#[derive(Debug)]
pub struct Watermarks {
    /// Buffered amount at which backpressure is triggered
    high: usize,
    /// Buffered amount at which backpressure is released
    low: usize,
    /// Whether backpressure is currently active
    is_active: Cell<bool>,
}

impl Watermarks {
    /// High watermark `high`, released once fully drained
    pub fn new(high: usize) -> Self {
        Self::with_watermarks(high, 0)
    }

    /// Set custom watermark thresholds
    pub fn with_watermarks(high: usize, low: usize) -> Self {
        let high = high.max(1);
        Self {
            high,
            low: low.min(high - 1),
            is_active: Cell::new(false),
        }
    }

    /// Check the buffered amount and update backpressure state.
    /// Returns true if backpressure is now active.
    pub fn check_and_update(&self, buffered: usize) -> bool {
        let was_active = self.is_active.get();

        let is_now_active = if was_active {
            buffered > self.low
        } else {
            buffered >= self.high
        };

        if is_now_active != was_active {
            self.is_active.set(is_now_active);
        }

        is_now_active
    }

    /// Whether more can be buffered without reaching the high watermark
    pub fn has_room(&self, buffered: usize) -> bool {
        buffered < self.high
    }

    /// Get whether backpressure is currently active
    pub fn is_active(&self) -> bool {
        self.is_active.get()
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Reset the backpressure state
    pub fn reset(&self) {
        self.is_active.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_activation() {
        let marks = Watermarks::new(16);
        assert!(!marks.check_and_update(15));
        assert!(marks.check_and_update(16));
        assert!(marks.is_active());
    }

    #[test]
    fn test_backpressure_release() {
        let marks = Watermarks::with_watermarks(10, 4);
        assert!(marks.check_and_update(12));
        // Still above low watermark
        assert!(marks.check_and_update(5));
        assert!(!marks.check_and_update(4));
        assert!(!marks.is_active());
    }

    #[test]
    fn test_watermark_thresholds() {
        let marks = Watermarks::with_watermarks(0, 25);
        assert_eq!(marks.high(), 1);
        assert_eq!(marks.low, 0);
        assert!(marks.has_room(0));
        assert!(!marks.has_room(1));
    }
}
