//! Line buffer diff → positional operations.
//!
//! Two levels:
//!
//! ```text
//! snapshot lines ──┐
//!                  ├── line opcodes ──┬── Insert / Delete → one op per range
//! buffer lines ────┘                  └── Replace → char opcodes over the
//!                                         joined ranges → ops at anchor + offset
//! ```
//!
//! Every position is computed against the *snapshot*, so the returned list
//! must be applied last-to-first. [`compute_ops`] returns forward order;
//! outgoing batches are reversed by the caller.
//!
//! Both levels use `similar`'s LCS diff. Runs of non-equal ops are folded
//! into a single opcode, so an `Equal` always separates two edits.

use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use similar::{capture_diff_slices, Algorithm, DiffTag};

use crate::ops::Operation;

// ─── Opcodes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Equal,
    Insert,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Opcode {
    tag: Tag,
    old: Range<usize>,
    new: Range<usize>,
}

fn edit_tag(old: &Range<usize>, new: &Range<usize>) -> Tag {
    match (old.is_empty(), new.is_empty()) {
        (true, _) => Tag::Insert,
        (_, true) => Tag::Delete,
        _ => Tag::Replace,
    }
}

/// Ordered opcodes turning `old` into `new`; no two edits are adjacent.
fn opcodes<T: Hash + Eq + Ord>(old: &[T], new: &[T]) -> Vec<Opcode> {
    let mut codes: Vec<Opcode> = Vec::new();

    for op in capture_diff_slices(Algorithm::Lcs, old, new) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if old_range.is_empty() && new_range.is_empty() {
            continue;
        }
        if tag == DiffTag::Equal {
            codes.push(Opcode {
                tag: Tag::Equal,
                old: old_range,
                new: new_range,
            });
            continue;
        }
        match codes.last_mut() {
            Some(last) if last.tag != Tag::Equal => {
                last.old.end = old_range.end;
                last.new.end = new_range.end;
                last.tag = edit_tag(&last.old, &last.new);
            }
            _ => codes.push(Opcode {
                tag: edit_tag(&old_range, &new_range),
                old: old_range,
                new: new_range,
            }),
        }
    }

    codes
}

// ─── Ops ───────────────────────────────────────────────────────────

/// Character length of a string.
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Offset of the first character of every line, plus one past the end.
///
/// `offsets[k]` = Σ (len(line) + 1) over lines before `k`.
pub fn line_offsets(lines: &[String]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(lines.len() + 1);
    let mut pos = 0;
    offsets.push(pos);
    for line in lines {
        pos += char_len(line) + 1;
        offsets.push(pos);
    }
    offsets
}

/// An editor buffer always has at least one line.
pub(crate) fn normalized(lines: &[String]) -> Cow<'_, [String]> {
    if lines.is_empty() {
        Cow::Owned(vec![String::new()])
    } else {
        Cow::Borrowed(lines)
    }
}

fn line_hash(line: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    line.hash(&mut hasher);
    hasher.finish()
}

/// Same line count and same per-line hashes.
pub fn unchanged(snapshot: &[String], buffer: &[String]) -> bool {
    snapshot.len() == buffer.len()
        && snapshot
            .iter()
            .zip(buffer)
            .all(|(old, new)| line_hash(old) == line_hash(new))
}

/// Operations turning `snapshot` into `buffer`, in forward order.
///
/// Apply them in reverse: `apply_ops(snapshot, reversed(ops)) == buffer`.
pub fn compute_ops(snapshot: &[String], buffer: &[String]) -> Vec<Operation> {
    let snapshot = normalized(snapshot);
    let buffer = normalized(buffer);
    if unchanged(&snapshot, &buffer) {
        return Vec::new();
    }

    let offsets = line_offsets(&snapshot);
    let doc_len = offsets[snapshot.len()] - 1;
    let mut ops = Vec::new();

    for code in opcodes(&snapshot[..], &buffer[..]) {
        match code.tag {
            Tag::Equal => {}

            Tag::Insert => {
                let text = buffer[code.new.clone()].join("\n");
                if code.old.start >= snapshot.len() {
                    // nothing follows to anchor on: attach to the document end
                    ops.push(Operation::insert(doc_len, format!("\n{text}")));
                } else {
                    ops.push(Operation::insert(
                        offsets[code.old.start],
                        format!("{text}\n"),
                    ));
                }
            }

            Tag::Delete => {
                let text = snapshot[code.old.clone()].join("\n");
                if code.old.end == snapshot.len() && code.old.start > 0 {
                    ops.push(Operation::delete(
                        offsets[code.old.start] - 1,
                        format!("\n{text}"),
                    ));
                } else {
                    ops.push(Operation::delete(
                        offsets[code.old.start],
                        format!("{text}\n"),
                    ));
                }
            }

            Tag::Replace => {
                let anchor = offsets[code.old.start];
                let old: Vec<char> = snapshot[code.old.clone()].join("\n").chars().collect();
                let new: Vec<char> = buffer[code.new.clone()].join("\n").chars().collect();
                replace_ops(anchor, &old, &new, &mut ops);
            }
        }
    }

    ops
}

/// Character-level ops for a replaced line range.
fn replace_ops(anchor: usize, old: &[char], new: &[char], ops: &mut Vec<Operation>) {
    let slice = |chars: &[char]| chars.iter().collect::<String>();

    for code in opcodes(old, new) {
        let position = anchor + code.old.start;
        match code.tag {
            Tag::Equal => {}
            Tag::Insert => ops.push(Operation::insert(position, slice(&new[code.new]))),
            Tag::Delete => ops.push(Operation::delete(position, slice(&old[code.old]))),
            Tag::Replace => {
                ops.push(Operation::insert(position, slice(&new[code.new])));
                ops.push(Operation::delete(position, slice(&old[code.old])));
            }
        }
    }
}
