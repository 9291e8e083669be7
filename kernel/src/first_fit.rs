//! First-fit physical frame allocator.
//!
//! Every free frame sits on `free_list` in ascending physical-address
//! order and carries the `PROPERTY` flag; the first frame of each free run
//! additionally holds the run length in `property`. Runs are maximal:
//! adjacent runs are merged when frames are freed.

use crate::list::ListEntry;
use crate::memlayout::{Page, PageFlags};
use crate::to_struct;

pub struct FreeArea {
    free_list: ListEntry,
    n_free: usize,
}

unsafe fn le2page(le: *mut ListEntry) -> *mut Page {
    to_struct!(le, Page, page_link)
}

impl FreeArea {
    pub const fn new() -> Self {
        FreeArea {
            free_list: ListEntry::new(),
            n_free: 0,
        }
    }

    /// Empty the free area. Must run once the struct is at its final
    /// address.
    pub unsafe fn init(&mut self) {
        self.free_list.init();
        self.n_free = 0;
    }

    pub fn n_free(&self) -> usize {
        self.n_free
    }

    /// Donate `n` contiguous, previously reserved frames starting at
    /// `base`. Callers feed runs in ascending address order, which keeps
    /// the list sorted without searching.
    pub unsafe fn init_memmap(&mut self, base: *mut Page, n: usize) {
        assert!(n > 0);
        let mut p = base;
        while p != base.add(n) {
            assert!((*p).reserved());
            (*p).flags = PageFlags::PROPERTY;
            (*p).property = 0;
            (*p).set_page_ref(0);
            self.free_list.add_before(&mut (*p).page_link);
            p = p.add(1);
        }
        (*base).property = n as u32;
        self.n_free += n;
    }

    /// Take the first `n` frames of the first run that can hold them.
    /// Returns null when no single run is large enough.
    pub unsafe fn alloc_pages(&mut self, n: usize) -> *mut Page {
        assert!(n > 0);
        if n > self.n_free {
            return core::ptr::null_mut();
        }

        let head = &mut self.free_list as *mut ListEntry;
        let mut le = self.free_list.next();
        while le != head {
            let p = le2page(le);
            // run heads carry the length; interior frames scan as 0
            if (*p).property as usize >= n {
                let remainder = (*p).property as usize - n;
                for _ in 0..n {
                    let next = (*le).next();
                    let pp = le2page(le);
                    (*pp).flags = PageFlags::RESERVED;
                    (*pp).property = 0;
                    (*le).del();
                    le = next;
                }
                if remainder > 0 {
                    // le now points at frame base+n, the new run head
                    (*le2page(le)).property = remainder as u32;
                }
                self.n_free -= n;
                return p;
            }
            le = (*le).next();
        }
        core::ptr::null_mut()
    }

    /// Return `n` frames starting at `base`, re-sorting them into the list
    /// and merging with the neighbouring runs.
    pub unsafe fn free_pages(&mut self, base: *mut Page, n: usize) {
        assert!(n > 0);

        let mut p = base;
        while p != base.add(n) {
            // a frame being freed must have come from alloc_pages; this
            // is where a double free trips
            assert!(
                (*p).reserved() && !(*p).flags.contains(PageFlags::PROPERTY),
                "free_pages: frame is not allocated"
            );
            (*p).flags = PageFlags::PROPERTY;
            (*p).property = 0;
            (*p).set_page_ref(0);
            p = p.add(1);
        }

        // find the first list node past base
        let head = &mut self.free_list as *mut ListEntry;
        let mut le = self.free_list.next();
        while le != head {
            if le2page(le) > base {
                break;
            }
            le = (*le).next();
        }
        // insert the run before it, keeping ascending order
        p = base;
        while p != base.add(n) {
            (*le).add_before(&mut (*p).page_link);
            p = p.add(1);
        }
        (*base).property = n as u32;

        // coalesce forward: the node after the run is its direct neighbour
        if le != head {
            let next = le2page(le);
            if base.add(n) == next {
                (*base).property += (*next).property;
                (*next).property = 0;
            }
        }

        // coalesce backward: fold into the previous run if it ends at
        // base - 1
        let mut le = (*base).page_link.prev();
        if le != head && le2page(le) == base.wrapping_sub(1) {
            while le != head {
                let q = le2page(le);
                if (*q).property > 0 {
                    (*q).property += (*base).property;
                    (*base).property = 0;
                    break;
                }
                le = (*le).prev();
            }
        }

        self.n_free += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena {
        pages: Vec<Page>,
        area: Box<FreeArea>,
    }

    impl Arena {
        fn new(n: usize) -> Self {
            let mut pages = Vec::with_capacity(n);
            for _ in 0..n {
                let mut pg = Page::empty();
                pg.flags = PageFlags::RESERVED;
                pages.push(pg);
            }
            let mut area = Box::new(FreeArea::new());
            unsafe {
                area.init();
                area.init_memmap(pages.as_mut_ptr(), n);
            }
            Arena { pages, area }
        }

        fn base(&mut self) -> *mut Page {
            self.pages.as_mut_ptr()
        }

        fn idx(&mut self, p: *mut Page) -> usize {
            let off = p as usize - self.base() as usize;
            off / core::mem::size_of::<Page>()
        }

        /// Walk the free list checking its structural invariants:
        /// ascending order, heads partition the nodes exactly, no two
        /// runs are adjacent.
        fn check_invariants(&mut self) {
            unsafe {
                let head = &mut self.area.free_list as *mut ListEntry;
                let mut le = self.area.free_list.next();
                let mut last: *mut Page = core::ptr::null_mut();
                let mut runs: Vec<(usize, usize)> = Vec::new();
                let mut run_left = 0usize;
                let mut count = 0usize;
                while le != head {
                    let p = le2page(le);
                    assert!(p > last, "free list out of order");
                    if run_left == 0 {
                        assert!((*p).property > 0, "orphan free frame");
                        run_left = (*p).property as usize;
                        runs.push((self.idx(p), run_left));
                    } else {
                        assert_eq!((*p).property, 0, "nested run head");
                        assert_eq!(p, last.add(1), "hole inside run");
                    }
                    assert!((*p).flags.contains(PageFlags::PROPERTY));
                    assert_eq!((*p).page_ref(), 0);
                    run_left -= 1;
                    count += 1;
                    last = p;
                    le = (*le).next();
                }
                assert_eq!(run_left, 0, "truncated run");
                assert_eq!(count, self.area.n_free(), "n_free out of sync");
                for w in runs.windows(2) {
                    let (s0, n0) = w[0];
                    let (s1, _) = w[1];
                    assert!(s0 + n0 < s1, "mergeable adjacent runs");
                }
            }
        }
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut a = Arena::new(64);
        assert_eq!(a.area.n_free(), 64);
        unsafe {
            let p = a.area.alloc_pages(8);
            assert!(!p.is_null());
            assert_eq!(a.idx(p), 0); // first fit takes the lowest run
            assert_eq!(a.area.n_free(), 56);
            assert!((*p).reserved());
            a.check_invariants();

            a.area.free_pages(p, 8);
            assert_eq!(a.area.n_free(), 64);
            a.check_invariants();

            // everything coalesced back into one run
            let all = a.area.alloc_pages(64);
            assert!(!all.is_null());
            assert_eq!(a.area.n_free(), 0);
        }
    }

    #[test]
    fn first_fit_skips_small_runs() {
        let mut a = Arena::new(32);
        unsafe {
            let p0 = a.area.alloc_pages(4); // [0,4)
            let p1 = a.area.alloc_pages(4); // [4,8)
            let _p2 = a.area.alloc_pages(4); // [8,12)
            a.area.free_pages(p0, 4); // small hole at 0
            a.area.free_pages(p1, 4); // merges to [0,8)
            a.check_invariants();

            // 12 pages cannot fit the [0,8) hole, must come from the tail
            let big = a.area.alloc_pages(12);
            assert_eq!(a.idx(big), 12);
            a.check_invariants();

            // but 8 pages reuse the hole
            let hole = a.area.alloc_pages(8);
            assert_eq!(a.idx(hole), 0);
            a.check_invariants();
        }
    }

    #[test]
    fn scrambled_frees_coalesce() {
        let mut a = Arena::new(40);
        unsafe {
            let mut blocks = Vec::new();
            for _ in 0..10 {
                blocks.push(a.area.alloc_pages(4));
            }
            assert_eq!(a.area.n_free(), 0);
            for &i in &[7usize, 2, 9, 0, 5, 3, 8, 1, 6, 4] {
                a.area.free_pages(blocks[i], 4);
                a.check_invariants();
            }
            assert_eq!(a.area.n_free(), 40);
            // one maximal run again
            let all = a.area.alloc_pages(40);
            assert!(!all.is_null());
        }
    }

    #[test]
    fn alloc_fails_without_a_large_enough_run() {
        let mut a = Arena::new(16);
        unsafe {
            let p0 = a.area.alloc_pages(8);
            let _p1 = a.area.alloc_pages(8);
            a.area.free_pages(p0, 8);
            // 8 free pages exist but no 9-page run
            assert!(a.area.alloc_pages(9).is_null());
            assert_eq!(a.area.n_free(), 8);
            a.check_invariants();
        }
    }

    #[test]
    fn partial_run_leaves_correct_remainder() {
        let mut a = Arena::new(16);
        unsafe {
            let p = a.area.alloc_pages(5);
            assert_eq!(a.idx(p), 0);
            a.check_invariants();
            // remainder head is frame 5 with 11 frames
            let q = a.area.alloc_pages(11);
            assert_eq!(a.idx(q), 5);
            assert_eq!(a.area.n_free(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_is_detected() {
        let mut a = Arena::new(8);
        unsafe {
            let p = a.area.alloc_pages(2);
            a.area.free_pages(p, 2);
            a.area.free_pages(p, 2);
        }
    }
}
