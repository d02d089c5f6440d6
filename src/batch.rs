//! Even batch splitting for the write path.
//!
//! Documents are split into a target number of roughly equal slices rather
//! than fixed-size chunks. Slices borrow from the input; nothing is copied,
//! dropped or reordered.

/// Split `items` into `target` slices whose lengths differ by at most one.
///
/// The first `len % target` slices carry the extra item. When there are
/// fewer items than `target`, a single slice holding everything is
/// returned (an empty input therefore yields one empty slice). A `target`
/// of zero is treated as one.
pub fn split_even<T>(items: &[T], target: usize) -> Vec<&[T]> {
    let target = target.max(1);
    if items.len() < target {
        return vec![items];
    }

    let base = items.len() / target;
    let extra = items.len() % target;

    let mut batches = Vec::with_capacity(target);
    let mut rest = items;
    for i in 0..target {
        let size = if i < extra { base + 1 } else { base };
        let (head, tail) = rest.split_at(size);
        batches.push(head);
        rest = tail;
    }
    batches
}
