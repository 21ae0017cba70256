//! Apply positional operations to a line-array buffer.
//!
//! Operations are applied exactly in the order given. Remote lists arrive
//! already in application order; locally computed lists must be reversed
//! first (see [`crate::diff`]).

use thiserror::Error;

use crate::diff::char_len;
use crate::ops::{Edit, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("offset {position} is past the end of the document ({len} chars)")]
    OffsetOutOfRange { position: usize, len: usize },
    #[error("deletion at {position} spans {lines} lines but only {available} remain")]
    SpanOutOfRange {
        position: usize,
        lines: usize,
        available: usize,
    },
}

/// Split `s` at a character index, clamped to its length.
fn split_at_char(s: &str, at: usize) -> (&str, &str) {
    match s.char_indices().nth(at) {
        Some((byte, _)) => s.split_at(byte),
        None => (s, ""),
    }
}

/// Line index and column of an absolute offset.
///
/// The offset belongs to the first line whose end (including its newline)
/// lies beyond it; the end of the document maps to the end of the last line.
fn locate(buffer: &[String], position: usize) -> Result<(usize, usize), PatchError> {
    let mut line_start = 0;
    for (index, line) in buffer.iter().enumerate() {
        let len = char_len(line);
        if position < line_start + len + 1 {
            return Ok((index, position - line_start));
        }
        line_start += len + 1;
    }
    Err(PatchError::OffsetOutOfRange {
        position,
        len: line_start.saturating_sub(1),
    })
}

fn insert(buffer: &mut Vec<String>, position: usize, text: &str) -> Result<(), PatchError> {
    let (index, column) = locate(buffer, position)?;
    let (head, tail) = split_at_char(&buffer[index], column);

    let mut pieces: Vec<String> = text.split('\n').map(String::from).collect();
    pieces[0].insert_str(0, head);
    if let Some(last) = pieces.last_mut() {
        last.push_str(tail);
    }

    buffer.splice(index..=index, pieces);
    Ok(())
}

fn delete(buffer: &mut Vec<String>, position: usize, text: &str) -> Result<(), PatchError> {
    let (index, column) = locate(buffer, position)?;
    let pieces: Vec<&str> = text.split('\n').collect();
    let span = pieces.len();

    if index + span > buffer.len() {
        return Err(PatchError::SpanOutOfRange {
            position,
            lines: span,
            available: buffer.len() - index,
        });
    }

    let last = index + span - 1;
    let keep_from = if span == 1 {
        column + char_len(text)
    } else {
        char_len(pieces[span - 1])
    };

    let (head, removed_first) = split_at_char(&buffer[index], column);
    let (removed_last, tail) = split_at_char(&buffer[last], keep_from);
    let matches = if span == 1 {
        split_at_char(removed_first, char_len(text)).0 == text
    } else {
        removed_first == pieces[0] && removed_last == pieces[span - 1]
    };
    if !matches {
        log::warn!("deleted text at {position} does not match the buffer");
    }

    let merged = format!("{head}{tail}");
    buffer.splice(index..=last, std::iter::once(merged));
    Ok(())
}

/// Apply a single operation.
pub fn apply_op(buffer: &mut Vec<String>, op: &Operation) -> Result<(), PatchError> {
    if buffer.is_empty() {
        buffer.push(String::new());
    }
    match &op.edit {
        Edit::Insert(text) => insert(buffer, op.position, text),
        Edit::Delete(text) => delete(buffer, op.position, text),
    }
}

/// Apply operations in the order given.
pub fn apply_ops(buffer: &mut Vec<String>, ops: &[Operation]) -> Result<(), PatchError> {
    if buffer.is_empty() {
        buffer.push(String::new());
    }
    for op in ops {
        apply_op(buffer, op)?;
    }
    Ok(())
}
