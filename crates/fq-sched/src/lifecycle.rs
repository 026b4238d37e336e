use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Bias set on the count once the last owner lets go.
const DESTROYING: u32 = 0x8000_0000;
const OWNERS: u32 = !DESTROYING;

/// Outcome of [`RefCount::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other owners remain.
    Retained,
    /// The caller dropped the last owner and must tear the object down.
    Destroy,
}

/// Owner count of a scheduler object.
///
/// Every list link and every task holding an object accounts for one owner.
/// Once the count drops to zero the object enters destruction and can never
/// be acquired again; only the releaser that observed [`Release::Destroy`]
/// runs the teardown.
#[derive(Debug)]
pub struct RefCount {
    word: AtomicU32,
    kind: &'static str,
}

impl RefCount {
    pub fn new(kind: &'static str, owners: u32) -> Self {
        assert!(owners & DESTROYING == 0, "{kind} created with too many owners");
        Self {
            word: AtomicU32::new(owners),
            kind,
        }
    }

    pub fn owners(&self) -> u32 {
        self.word.load(Ordering::Acquire) & OWNERS
    }

    pub fn is_destroying(&self) -> bool {
        self.word.load(Ordering::Acquire) & DESTROYING != 0
    }

    /// Adds an owner unless the object is already being destroyed.
    pub fn try_retain(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & DESTROYING != 0 {
                return false;
            }
            assert!(current < OWNERS, "{} owner count overflow", self.kind);
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Adds an owner.
    ///
    /// # Panics
    ///
    /// Acquiring an object that is being destroyed is a lifecycle bug and
    /// traps here.
    pub fn retain(&self) {
        if !self.try_retain() {
            panic!("acquired {} while it is being destroyed", self.kind);
        }
    }

    /// Drops one owner.
    ///
    /// # Panics
    ///
    /// Releasing an object that has no owners left traps.
    pub fn release(&self) -> Release {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let owners = current & OWNERS;
            if current & DESTROYING != 0 || owners == 0 {
                panic!("released {} with no owners left", self.kind);
            }
            let (next, outcome) = if owners == 1 {
                (DESTROYING, Release::Destroy)
            } else {
                (current - 1, Release::Retained)
            };
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return outcome,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn last_release_enters_destruction() {
        let refs = RefCount::new("binding", 2);
        refs.retain();
        assert_eq!(refs.owners(), 3);
        assert_eq!(refs.release(), Release::Retained);
        assert_eq!(refs.release(), Release::Retained);
        assert!(!refs.is_destroying());
        assert_eq!(refs.release(), Release::Destroy);
        assert!(refs.is_destroying());
        assert_eq!(refs.owners(), 0);
    }

    #[test]
    fn destruction_is_permanent() {
        let refs = RefCount::new("device", 1);
        assert_eq!(refs.release(), Release::Destroy);
        assert!(!refs.try_retain());
        assert!(!refs.try_retain());
        assert!(refs.is_destroying());
    }

    #[test]
    #[should_panic(expected = "being destroyed")]
    fn retain_during_destruction_traps() {
        let refs = RefCount::new("workload", 1);
        refs.release();
        refs.retain();
    }

    #[test]
    #[should_panic(expected = "no owners left")]
    fn release_without_owner_traps() {
        let refs = RefCount::new("workload", 0);
        refs.release();
    }

    #[test]
    #[should_panic(expected = "no owners left")]
    fn double_destroy_traps() {
        let refs = RefCount::new("binding", 1);
        refs.release();
        refs.release();
    }

    #[test]
    fn exactly_one_releaser_sees_destroy() {
        let refs = Arc::new(RefCount::new("device", 64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let refs = Arc::clone(&refs);
                std::thread::spawn(move || {
                    (0..8)
                        .filter(|_| refs.release() == Release::Destroy)
                        .count()
                })
            })
            .collect();
        let destroyed: usize = handles
            .into_iter()
            .map(|h| h.join().expect("release thread panicked"))
            .sum();
        assert_eq!(destroyed, 1);
        assert!(refs.is_destroying());
    }
}
