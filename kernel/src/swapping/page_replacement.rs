/// The frame table as seen by a replacement policy.
pub trait FrameScan {
    /// Number of frames in the table. Frame indices are `0..len()`.
    fn len(&self) -> usize;

    /// Whether frame `index` may be chosen as a victim: allocated, bound to a
    /// page, and not pinned.
    fn is_candidate(&self, index: usize) -> bool;

    /// Returns whether frame `index` was referenced since the last call, and
    /// clears the referenced bit.
    fn test_and_clear_accessed(&self, index: usize) -> bool;
}

pub trait PageReplacementPolicy {
    /// Picks a frame to evict, or returns [`None`] if no frame is a candidate.
    fn evict_page(&mut self, frames: &dyn FrameScan) -> Option<usize>;
}

/// Second-chance replacement. The hand sweeps the frame table in order; a
/// referenced frame has its bit cleared and is passed over once.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl PageReplacementPolicy for Clock {
    fn evict_page(&mut self, frames: &dyn FrameScan) -> Option<usize> {
        let len = frames.len();
        if len == 0 {
            return None;
        }

        // The first pass may only clear referenced bits; the second is then
        // guaranteed to find a victim unless every frame is ineligible.
        for _ in 0..2 * len {
            let index = self.hand % len;
            self.hand = (index + 1) % len;

            if !frames.is_candidate(index) {
                continue;
            }
            if frames.test_and_clear_accessed(index) {
                continue;
            }
            return Some(index);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use proptest::prelude::*;

    struct Frames {
        pinned: Vec<bool>,
        accessed: RefCell<Vec<bool>>,
    }

    impl Frames {
        fn new(pinned: Vec<bool>, accessed: Vec<bool>) -> Self {
            assert_eq!(pinned.len(), accessed.len());
            Self {
                pinned,
                accessed: RefCell::new(accessed),
            }
        }
    }

    impl FrameScan for Frames {
        fn len(&self) -> usize {
            self.pinned.len()
        }

        fn is_candidate(&self, index: usize) -> bool {
            !self.pinned[index]
        }

        fn test_and_clear_accessed(&self, index: usize) -> bool {
            core::mem::replace(&mut self.accessed.borrow_mut()[index], false)
        }
    }

    #[test]
    fn test_picks_first_unreferenced_frame() {
        let frames = Frames::new(vec![false; 4], vec![true, true, false, false]);
        let mut clock = Clock::default();
        assert_eq!(clock.evict_page(&frames), Some(2));
        // Frames 0 and 1 lost their second chance on the way past.
        assert_eq!(*frames.accessed.borrow(), vec![false, false, false, false]);
        assert_eq!(clock.hand(), 3);
    }

    #[test]
    fn test_hand_persists_between_calls() {
        let frames = Frames::new(vec![false; 3], vec![false; 3]);
        let mut clock = Clock::default();
        assert_eq!(clock.evict_page(&frames), Some(0));
        assert_eq!(clock.evict_page(&frames), Some(1));
        assert_eq!(clock.evict_page(&frames), Some(2));
        assert_eq!(clock.evict_page(&frames), Some(0));
    }

    #[test]
    fn test_all_referenced_returns_to_hand() {
        let frames = Frames::new(vec![false; 3], vec![true; 3]);
        let mut clock = Clock { hand: 1 };
        assert_eq!(clock.evict_page(&frames), Some(1));
    }

    #[test]
    fn test_skips_pinned_frames() {
        let frames = Frames::new(vec![true, false, true], vec![false, true, false]);
        let mut clock = Clock::default();
        assert_eq!(clock.evict_page(&frames), Some(1));
    }

    #[test]
    fn test_all_pinned_fails() {
        let frames = Frames::new(vec![true; 5], vec![false; 5]);
        let mut clock = Clock::default();
        assert_eq!(clock.evict_page(&frames), None);
        assert_eq!(clock.evict_page(&Frames::new(vec![], vec![])), None);
    }

    proptest! {
        #[test]
        fn prop_never_picks_pinned_frame(
            frames in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..64),
            hand in 0usize..64,
            rounds in 1usize..8,
        ) {
            let (pinned, accessed): (Vec<bool>, Vec<bool>) = frames.into_iter().unzip();
            let any_candidate = pinned.iter().any(|&p| !p);
            let frames = Frames::new(pinned.clone(), accessed);
            let mut clock = Clock { hand };
            for _ in 0..rounds {
                match clock.evict_page(&frames) {
                    Some(victim) => prop_assert!(!pinned[victim]),
                    None => prop_assert!(!any_candidate),
                }
            }
        }
    }
}
