// Dense per-thread ids, recycled through a free list so counter cells can be
// indexed with a small modulus.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::*;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    static ref FREE_IDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());
}

thread_local! {
    static THREAD_META: ThreadMeta = ThreadMeta::new();
}

struct ThreadMeta {
    id: usize,
}

impl ThreadMeta {
    fn new() -> Self {
        let id = FREE_IDS
            .lock()
            .pop()
            .unwrap_or_else(|| NEXT_ID.fetch_add(1, AcqRel));
        ThreadMeta { id }
    }
}

impl Drop for ThreadMeta {
    fn drop(&mut self) {
        FREE_IDS.lock().push(self.id);
    }
}

#[inline(always)]
pub(crate) fn current() -> usize {
    THREAD_META.with(|m| m.id)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn ids_are_dense_and_recycled() {
        let first = thread::spawn(current).join().unwrap();
        let second = thread::spawn(current).join().unwrap();
        // The first thread has exited, so its id is available again.
        assert_eq!(first, second);
    }
}
