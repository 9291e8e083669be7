//! Intrusive skew heap.
//!
//! The run queue keys this by process stride; nodes are embedded in the
//! owning struct so enqueue/dequeue never allocate. `comp` returns -1, 0
//! or 1 like a C comparator; only -1 keeps the first argument on top, so a
//! comparator that never returns 0 for distinct nodes gives a total order.

use core::ptr;

pub type CompF = unsafe fn(*mut SkewHeapEntry, *mut SkewHeapEntry) -> i32;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct SkewHeapEntry {
    parent: *mut SkewHeapEntry,
    left: *mut SkewHeapEntry,
    right: *mut SkewHeapEntry,
}

impl SkewHeapEntry {
    pub const fn new() -> Self {
        SkewHeapEntry {
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
        }
    }

    pub unsafe fn init(&mut self) {
        self.parent = ptr::null_mut();
        self.left = ptr::null_mut();
        self.right = ptr::null_mut();
    }
}

pub unsafe fn skew_heap_merge(
    a: *mut SkewHeapEntry,
    b: *mut SkewHeapEntry,
    comp: CompF,
) -> *mut SkewHeapEntry {
    if a.is_null() {
        return b;
    }
    if b.is_null() {
        return a;
    }

    // smaller key on top; children swap on the way down
    let (top, other) = if comp(a, b) == -1 { (a, b) } else { (b, a) };
    let left = (*top).left;
    (*top).left = skew_heap_merge((*top).right, other, comp);
    (*top).right = left;
    if !(*top).left.is_null() {
        (*(*top).left).parent = top;
    }
    (*top).parent = ptr::null_mut();
    top
}

pub unsafe fn skew_heap_insert(
    root: *mut SkewHeapEntry,
    node: *mut SkewHeapEntry,
    comp: CompF,
) -> *mut SkewHeapEntry {
    (*node).init();
    skew_heap_merge(root, node, comp)
}

pub unsafe fn skew_heap_remove(
    root: *mut SkewHeapEntry,
    node: *mut SkewHeapEntry,
    comp: CompF,
) -> *mut SkewHeapEntry {
    let parent = (*node).parent;
    let rep = skew_heap_merge((*node).left, (*node).right, comp);
    if !rep.is_null() {
        (*rep).parent = parent;
    }
    if !parent.is_null() {
        if (*parent).left == node {
            (*parent).left = rep;
        } else {
            (*parent).right = rep;
        }
        root
    } else {
        rep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::to_struct;

    struct Item {
        key: i32,
        node: SkewHeapEntry,
    }

    unsafe fn comp(a: *mut SkewHeapEntry, b: *mut SkewHeapEntry) -> i32 {
        let ka = (*to_struct!(a, Item, node)).key;
        let kb = (*to_struct!(b, Item, node)).key;
        if ka < kb {
            -1
        } else if ka == kb {
            0
        } else {
            1
        }
    }

    #[test]
    fn pops_in_key_order() {
        unsafe {
            let keys = [7, 3, 9, 1, 5, 8, 2, 6, 4, 0];
            let mut items: Vec<Box<Item>> = keys
                .iter()
                .map(|&key| {
                    Box::new(Item {
                        key,
                        node: SkewHeapEntry::new(),
                    })
                })
                .collect();

            let mut root: *mut SkewHeapEntry = core::ptr::null_mut();
            for it in items.iter_mut() {
                root = skew_heap_insert(root, &mut it.node as *mut _, comp);
            }

            let mut popped = Vec::new();
            while !root.is_null() {
                let item = to_struct!(root, Item, node);
                popped.push((*item).key);
                root = skew_heap_remove(root, root, comp);
            }
            assert_eq!(popped, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        }
    }

    #[test]
    fn remove_interior_node() {
        unsafe {
            let mut items: Vec<Box<Item>> = (0..8)
                .map(|key| {
                    Box::new(Item {
                        key,
                        node: SkewHeapEntry::new(),
                    })
                })
                .collect();

            let mut root: *mut SkewHeapEntry = core::ptr::null_mut();
            for it in items.iter_mut() {
                root = skew_heap_insert(root, &mut it.node as *mut _, comp);
            }

            // yank key 3 out of the middle
            root = skew_heap_remove(root, &mut items[3].node as *mut _, comp);

            let mut popped = Vec::new();
            while !root.is_null() {
                let item = to_struct!(root, Item, node);
                popped.push((*item).key);
                root = skew_heap_remove(root, root, comp);
            }
            assert_eq!(popped, vec![0, 1, 2, 4, 5, 6, 7]);
        }
    }
}
