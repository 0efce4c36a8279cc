//! Operational transformation: pure transform / apply / compose functions.
//!
//! ```text
//!            base
//!          ╱      ╲
//!        a          b
//!        │          │
//!  T(b, a)          T(a, b)
//!          ╲      ╱
//!          converged
//! ```
//!
//! For any `a`, `b` generated against the same base text,
//! `apply(apply(base, b), transform(a, b)) == apply(apply(base, a), transform(b, a))`.
//!
//! Conflict rules:
//! - concurrent inserts at one position are ordered by `Operation::tie_break`
//! - an insert strictly inside a concurrently deleted range is absorbed by
//!   the delete; an insert touching the range boundary survives
//! - overlapping deletes remove the shared span only once
//!
//! Undo does not use the absorb rule: [`rebase_deletion`] keeps a deletion
//! to the characters it originally covered, splitting around anything
//! inserted inside it later.

use std::cmp::Ordering;

use crate::error::{CollabError, CollabResult};
use crate::operation::{OpKind, Operation};

/// Adjust `a` so it can be applied after `b`.
///
/// Keeps `a`'s author, timestamp and origin version; the caller rebases the
/// origin once the whole intervening history has been folded in.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let mut out = a.clone();

    match (&a.kind, &b.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { text: b_text }) => {
            let b_len = b_text.chars().count();
            let after_b = a.position > b.position
                || (a.position == b.position && a.tie_break(b) != Ordering::Less);
            if after_b {
                out.position += b_len;
            }
        }

        (OpKind::Insert { .. }, OpKind::Delete { length }) => {
            let (start, end) = (b.position, b.position + length);
            if a.position <= start {
                // before the deleted range, untouched
            } else if a.position >= end {
                out.position -= length;
            } else {
                // Inside the deleted range: the delete swallows it.
                out.position = start;
                out.kind = OpKind::Insert { text: String::new() };
            }
        }

        (OpKind::Delete { length }, OpKind::Insert { text: b_text }) => {
            let (start, end) = (a.position, a.position + length);
            let b_len = b_text.chars().count();
            if b.position <= start {
                out.position += b_len;
            } else if b.position < end {
                // Mirror of the absorb rule above.
                out.kind = OpKind::Delete { length: length + b_len };
            }
        }

        (OpKind::Delete { length: a_len }, OpKind::Delete { length: b_len }) => {
            let (a_start, a_end) = (a.position, a.position + a_len);
            let (b_start, b_end) = (b.position, b.position + b_len);
            if a_end <= b_start {
                // entirely before b
            } else if a_start >= b_end {
                out.position -= b_len;
            } else {
                let overlap = a_end.min(b_end).saturating_sub(a_start.max(b_start));
                out.position = a_start.min(b_start);
                out.kind = OpKind::Delete { length: a_len - overlap };
            }
        }
    }

    out
}

/// Apply an operation to `text`, returning the new text.
///
/// Fails with `OutOfRange` if the operation reaches past the end of the text;
/// the input is never modified.
pub fn apply(text: &str, op: &Operation) -> CollabResult<String> {
    let len = text.chars().count();
    let end = op.end();
    if op.position > len || end > len {
        return Err(CollabError::OutOfRange {
            op_end: end.max(op.position),
            len,
        });
    }

    let start_byte = byte_offset(text, op.position);
    match &op.kind {
        OpKind::Insert { text: inserted } => {
            let mut out = String::with_capacity(text.len() + inserted.len());
            out.push_str(&text[..start_byte]);
            out.push_str(inserted);
            out.push_str(&text[start_byte..]);
            Ok(out)
        }
        OpKind::Delete { .. } => {
            let end_byte = byte_offset(text, end);
            let mut out = String::with_capacity(text.len() - (end_byte - start_byte));
            out.push_str(&text[..start_byte]);
            out.push_str(&text[end_byte..]);
            Ok(out)
        }
    }
}

/// Characters `[start, start + len)` of `text`, clamped to its length.
pub fn slice_chars(text: &str, start: usize, len: usize) -> String {
    text.chars().skip(start).take(len).collect()
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

/// Merge `second` (applied right after `first`) into a single operation.
///
/// Only adjacent edits by the same user are merged: typing runs, forward
/// deletes, backspace runs, and deletes inside freshly inserted text.
/// Returns `None` when the pair cannot be expressed as one operation.
pub fn compose(first: &Operation, second: &Operation) -> Option<Operation> {
    if first.user_id != second.user_id {
        return None;
    }

    let kind_and_position = match (&first.kind, &second.kind) {
        (OpKind::Insert { text: t1 }, OpKind::Insert { text: t2 }) => {
            let len1 = t1.chars().count();
            if second.position < first.position || second.position > first.position + len1 {
                return None;
            }
            let split = second.position - first.position;
            let mut merged = slice_chars(t1, 0, split);
            merged.push_str(t2);
            merged.push_str(&slice_chars(t1, split, len1 - split));
            (OpKind::Insert { text: merged }, first.position)
        }

        (OpKind::Delete { length: l1 }, OpKind::Delete { length: l2 }) => {
            if second.position == first.position {
                (OpKind::Delete { length: l1 + l2 }, first.position)
            } else if second.position + l2 == first.position {
                (OpKind::Delete { length: l1 + l2 }, second.position)
            } else {
                return None;
            }
        }

        (OpKind::Insert { text: t1 }, OpKind::Delete { length: l2 }) => {
            let len1 = t1.chars().count();
            if second.position < first.position || second.end() > first.position + len1 {
                return None;
            }
            let cut = second.position - first.position;
            let mut merged = slice_chars(t1, 0, cut);
            merged.push_str(&slice_chars(t1, cut + l2, len1 - cut - l2));
            (OpKind::Insert { text: merged }, first.position)
        }

        (OpKind::Delete { .. }, OpKind::Insert { .. }) => return None,
    };

    let (kind, position) = kind_and_position;
    Some(Operation {
        kind,
        position,
        origin_version: first.origin_version,
        user_id: first.user_id.clone(),
        timestamp: second.timestamp,
    })
}

/// Collapse a run of operations with `compose`, dropping resulting no-ops.
///
/// Display/snapshot use only; the per-version log keeps the originals.
pub fn compact(ops: &[Operation]) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        let merged = out.last().and_then(|last| compose(last, op));
        match merged {
            Some(m) => {
                out.pop();
                out.push(m);
            }
            None => out.push(op.clone()),
        }
    }
    out.retain(|op| !op.is_noop());
    out
}

/// A char range `(start, len)` of the current text.
pub type Span = (usize, usize);

/// Move a deletion of `spans` (sorted, disjoint) past a later operation `b`.
///
/// Text inserted strictly inside a span splits it instead of growing it, so
/// the deletion only ever removes characters it covered when it was
/// created. Spans that `b` deleted entirely disappear.
pub fn rebase_deletion(spans: &[Span], b: &Operation) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::with_capacity(spans.len() + 1);
    let mut push = |start: usize, len: usize| {
        if len == 0 {
            return;
        }
        match out.last_mut() {
            Some((s, l)) if *s + *l == start => *l += len,
            _ => out.push((start, len)),
        }
    };

    for &(start, len) in spans {
        let end = start + len;
        match &b.kind {
            OpKind::Insert { text } => {
                let n = text.chars().count();
                let at = b.position;
                if at <= start {
                    push(start + n, len);
                } else if at >= end {
                    push(start, len);
                } else {
                    push(start, at - start);
                    push(at + n, end - at);
                }
            }
            OpKind::Delete { length } => {
                let (d_start, d_end) = (b.position, b.position + length);
                let shift = |x: usize| {
                    if x <= d_start {
                        x
                    } else if x >= d_end {
                        x - length
                    } else {
                        d_start
                    }
                };
                let (s, e) = (shift(start), shift(end));
                push(s, e - s);
            }
        }
    }
    out
}

/// The operation that undoes `op`.
///
/// Deletes can only be inverted when the removed text is known.
pub fn invert(op: &Operation, removed: Option<&str>) -> Option<Operation> {
    let kind = match &op.kind {
        OpKind::Insert { text } => OpKind::Delete {
            length: text.chars().count(),
        },
        OpKind::Delete { .. } => OpKind::Insert {
            text: removed?.to_string(),
        },
    };
    Some(Operation { kind, ..op.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(pos: usize, text: &str, user: &str, ts: u64) -> Operation {
        Operation::insert(pos, text, user, ts)
    }

    fn del(pos: usize, len: usize, user: &str) -> Operation {
        Operation::delete(pos, len, user, 0)
    }

    /// Apply `b` then `a'` and `a` then `b'`; both paths must agree.
    fn converge(base: &str, a: &Operation, b: &Operation) -> String {
        let left = apply(&apply(base, b).unwrap(), &transform(a, b)).unwrap();
        let right = apply(&apply(base, a).unwrap(), &transform(b, a)).unwrap();
        assert_eq!(left, right, "diverged on {base:?} with a={a:?} b={b:?}");
        left
    }

    // ── apply ────────────────────────────────────────────────────

    #[test]
    fn test_apply_insert_and_delete() {
        assert_eq!(apply("hello", &ins(5, " world", "u", 0)).unwrap(), "hello world");
        assert_eq!(apply("hello world", &del(5, 6, "u")).unwrap(), "hello");
        assert_eq!(apply("", &ins(0, "x", "u", 0)).unwrap(), "x");
    }

    #[test]
    fn test_apply_multibyte() {
        assert_eq!(apply("héllo", &ins(2, "✓", "u", 0)).unwrap(), "hé✓llo");
        assert_eq!(apply("hé✓llo", &del(1, 2, "u")).unwrap(), "hllo");
    }

    #[test]
    fn test_apply_out_of_range() {
        let err = apply("abc", &ins(4, "x", "u", 0)).unwrap_err();
        assert_eq!(err, CollabError::OutOfRange { op_end: 4, len: 3 });

        let err = apply("abc", &del(2, 2, "u")).unwrap_err();
        assert_eq!(err, CollabError::OutOfRange { op_end: 4, len: 3 });
    }

    // ── transform: the four kind pairs ───────────────────────────

    #[test]
    fn test_insert_insert_positions() {
        let a = ins(2, "A", "u1", 0);
        let b = ins(4, "B", "u2", 0);
        assert_eq!(transform(&a, &b).position, 2);
        assert_eq!(transform(&b, &a).position, 5);
        assert_eq!(converge("abcdef", &a, &b), "abAcdBef");
    }

    #[test]
    fn test_insert_after_delete_shifts_left() {
        let a = ins(5, "A", "u1", 0);
        let b = del(2, 2, "u2");
        assert_eq!(transform(&a, &b).position, 3);
        assert_eq!(converge("abcdefg", &a, &b), "abeAfg");
    }

    #[test]
    fn test_insert_inside_delete_is_absorbed() {
        let a = ins(3, "XY", "u1", 0);
        let b = del(1, 4, "u2");
        let a2 = transform(&a, &b);
        assert!(a2.is_noop());
        assert_eq!(a2.position, 1);

        let b2 = transform(&b, &a);
        assert_eq!(b2.kind, OpKind::Delete { length: 6 });
        assert_eq!(converge("abcdefg", &a, &b), "afg");
    }

    #[test]
    fn test_insert_at_delete_boundary_survives() {
        let start = ins(1, "S", "u1", 0);
        let end = ins(5, "E", "u1", 0);
        let d = del(1, 4, "u2");
        assert_eq!(converge("abcdefg", &start, &d), "aSfg");
        assert_eq!(converge("abcdefg", &end, &d), "aEfg");
    }

    #[test]
    fn test_delete_delete_overlap() {
        let a = del(1, 4, "u1"); // bcde
        let b = del(3, 3, "u2"); // def
        let a2 = transform(&a, &b);
        assert_eq!(a2.position, 1);
        assert_eq!(a2.kind, OpKind::Delete { length: 2 });
        assert_eq!(converge("abcdefgh", &a, &b), "agh");
    }

    #[test]
    fn test_delete_delete_identical_becomes_noop() {
        let a = del(2, 3, "u1");
        let b = del(2, 3, "u2");
        assert!(transform(&a, &b).is_noop());
        assert_eq!(converge("abcdefg", &a, &b), "abfg");
    }

    #[test]
    fn test_delete_contained_in_other_delete() {
        let outer = del(1, 5, "u1");
        let inner = del(2, 2, "u2");
        assert!(transform(&inner, &outer).is_noop());
        assert_eq!(transform(&outer, &inner).kind, OpKind::Delete { length: 3 });
        assert_eq!(converge("abcdefgh", &outer, &inner), "agh");
    }

    // ── tie-break ────────────────────────────────────────────────

    #[test]
    fn test_tie_break_same_timestamp_orders_by_user() {
        let a = ins(0, "A", "A", 100);
        let b = ins(0, "B", "B", 100);
        assert_eq!(converge("", &a, &b), "AB");
        assert_eq!(converge("", &b, &a), "AB");
    }

    #[test]
    fn test_tie_break_earlier_timestamp_first() {
        let late = ins(0, "late", "A", 200);
        let early = ins(0, "early", "Z", 100);
        assert_eq!(converge("", &late, &early), "earlylate");
    }

    #[test]
    fn test_tie_break_identical_keys_still_converge() {
        let a = ins(1, "x", "same", 5);
        let b = ins(1, "x", "same", 5);
        assert_eq!(converge("ab", &a, &b), "axxb");
    }

    #[test]
    fn test_convergence_exhaustive_small_grid() {
        let base = "abcdef";
        let n = base.chars().count();

        let mut ops = Vec::new();
        for pos in 0..=n {
            ops.push(ins(pos, "XY", "u1", 7));
            ops.push(ins(pos, "z", "u2", 7));
            for len in 1..=(n - pos) {
                ops.push(del(pos, len, "u3"));
            }
        }

        for a in &ops {
            for b in &ops {
                converge(base, a, b);
            }
        }
    }

    #[test]
    fn test_transform_preserves_author_and_timestamp() {
        let a = ins(3, "A", "alice", 42).with_origin(9);
        let b = del(0, 2, "bob");
        let a2 = transform(&a, &b);
        assert_eq!(a2.user_id, "alice");
        assert_eq!(a2.timestamp, 42);
        assert_eq!(a2.origin_version, 9);
    }

    // ── compose / compact / invert ───────────────────────────────

    #[test]
    fn test_compose_typing_run() {
        let first = ins(0, "Hel", "u", 1);
        let second = ins(3, "lo", "u", 2);
        let merged = compose(&first, &second).unwrap();
        assert_eq!(merged.kind, OpKind::Insert { text: "Hello".into() });
        assert_eq!(merged.timestamp, 2);
        assert_eq!(
            apply("", &merged).unwrap(),
            apply(&apply("", &first).unwrap(), &second).unwrap()
        );
    }

    #[test]
    fn test_compose_backspace_and_forward_delete() {
        let backspace = compose(&del(5, 1, "u"), &del(4, 1, "u")).unwrap();
        assert_eq!((backspace.position, backspace.span()), (4, 2));

        let forward = compose(&del(2, 1, "u"), &del(2, 3, "u")).unwrap();
        assert_eq!((forward.position, forward.span()), (2, 4));
    }

    #[test]
    fn test_compose_delete_inside_insert() {
        let merged = compose(&ins(2, "abcd", "u", 1), &del(3, 2, "u", )).unwrap();
        assert_eq!(merged.kind, OpKind::Insert { text: "ad".into() });
        assert_eq!(merged.position, 2);
    }

    #[test]
    fn test_compose_rejects_other_users_and_gaps() {
        assert!(compose(&ins(0, "a", "u1", 0), &ins(1, "b", "u2", 0)).is_none());
        assert!(compose(&ins(0, "a", "u", 0), &ins(5, "b", "u", 0)).is_none());
        assert!(compose(&del(0, 1, "u"), &ins(0, "b", "u", 0)).is_none());
    }

    #[test]
    fn test_compact_equivalent_to_sequential_apply() {
        let ops = vec![
            ins(0, "Hel", "u", 1),
            ins(3, "lo", "u", 2),
            ins(5, "!", "v", 3),
            del(5, 1, "v"),
        ];
        let sequential = ops.iter().fold(String::new(), |t, op| apply(&t, op).unwrap());
        let compacted = compact(&ops);
        assert_eq!(compacted.len(), 1);
        let replayed = compacted.iter().fold(String::new(), |t, op| apply(&t, op).unwrap());
        assert_eq!(sequential, replayed);
    }

    #[test]
    fn test_rebase_deletion_splits_around_later_insert() {
        // "world" is to be deleted; "X" lands inside it afterwards.
        let spans = rebase_deletion(&[(0, 5)], &ins(2, "X", "bob", 0));
        assert_eq!(spans, vec![(0, 2), (3, 3)]);

        let mut text = apply("world", &ins(2, "X", "bob", 0)).unwrap();
        for &(start, len) in spans.iter().rev() {
            text = apply(&text, &del(start, len, "alice")).unwrap();
        }
        assert_eq!(text, "X");
    }

    #[test]
    fn test_rebase_deletion_boundaries_and_shifts() {
        assert_eq!(rebase_deletion(&[(2, 3)], &ins(2, "ab", "u", 0)), vec![(4, 3)]);
        assert_eq!(rebase_deletion(&[(2, 3)], &ins(5, "ab", "u", 0)), vec![(2, 3)]);
        assert_eq!(rebase_deletion(&[(4, 2)], &del(0, 3, "u")), vec![(1, 2)]);
        assert_eq!(rebase_deletion(&[(2, 4)], &del(3, 2, "u")), vec![(2, 2)]);
    }

    #[test]
    fn test_rebase_deletion_merges_and_vanishes() {
        // Deleting the text that split a span joins the halves again.
        assert_eq!(rebase_deletion(&[(0, 2), (3, 3)], &del(2, 1, "u")), vec![(0, 5)]);
        assert!(rebase_deletion(&[(1, 2)], &del(0, 4, "u")).is_empty());
    }

    #[test]
    fn test_invert_roundtrip() {
        let text = "hello world";
        let d = del(5, 6, "u");
        let removed = slice_chars(text, 5, 6);
        let after = apply(text, &d).unwrap();
        let undo = invert(&d, Some(&removed)).unwrap();
        assert_eq!(apply(&after, &undo).unwrap(), text);

        let i = ins(0, ">> ", "u", 0);
        let after = apply(text, &i).unwrap();
        assert_eq!(apply(&after, &invert(&i, None).unwrap()).unwrap(), text);

        assert!(invert(&d, None).is_none());
    }
}
