//! Line diffs: a lossless patch codec for edit chains and grouped line
//! changes for timeline display.
//!
//! Patches are a sequence of [`PatchOp`]s over the base text. `Retain` and
//! `Delete` count bytes of the base; `Insert` carries new text. Applying a
//! patch to anything but its exact base fails instead of producing garbage.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use notevault_core::{DiffChange, DiffChangeKind, Error, Result};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, DiffTag, TextDiff};
use std::io::{Read, Write};

/// One step of a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

/// Patch turning `old` into `new`
pub fn make_patch(old: &str, new: &str) -> Vec<PatchOp> {
    let diff = TextDiff::from_lines(old, new);
    let old_lines = diff.old_slices();
    let new_lines = diff.new_slices();
    let byte_len = |lines: &[&str]| lines.iter().map(|l| l.len()).sum::<usize>();

    let mut ops: Vec<PatchOp> = Vec::new();
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => push_op(&mut ops, PatchOp::Retain(byte_len(&old_lines[old_range]))),
            DiffTag::Delete => push_op(&mut ops, PatchOp::Delete(byte_len(&old_lines[old_range]))),
            DiffTag::Insert => push_op(&mut ops, PatchOp::Insert(new_lines[new_range].concat())),
            DiffTag::Replace => {
                push_op(&mut ops, PatchOp::Delete(byte_len(&old_lines[old_range])));
                push_op(&mut ops, PatchOp::Insert(new_lines[new_range].concat()));
            }
        }
    }
    ops
}

/// Append, merging with a trailing op of the same kind
fn push_op(ops: &mut Vec<PatchOp>, op: PatchOp) {
    match &op {
        PatchOp::Retain(0) | PatchOp::Delete(0) => return,
        PatchOp::Insert(text) if text.is_empty() => return,
        _ => {}
    }
    let merged = match (ops.last_mut(), &op) {
        (Some(PatchOp::Retain(n)), PatchOp::Retain(m)) => {
            *n += m;
            true
        }
        (Some(PatchOp::Delete(n)), PatchOp::Delete(m)) => {
            *n += m;
            true
        }
        (Some(PatchOp::Insert(text)), PatchOp::Insert(more)) => {
            text.push_str(more);
            true
        }
        _ => false,
    };
    if !merged {
        ops.push(op);
    }
}

/// Apply a patch to its base text
pub fn apply_patch(base: &str, ops: &[PatchOp]) -> Result<String> {
    let mut out = String::with_capacity(base.len());
    let mut pos = 0usize;

    for op in ops {
        match op {
            PatchOp::Retain(n) => {
                out.push_str(base_slice(base, pos, *n)?);
                pos += n;
            }
            PatchOp::Delete(n) => {
                base_slice(base, pos, *n)?;
                pos += n;
            }
            PatchOp::Insert(text) => out.push_str(text),
        }
    }

    if pos != base.len() {
        return Err(Error::corrupt(format!(
            "Patch covers {} of {} base bytes",
            pos,
            base.len()
        )));
    }
    Ok(out)
}

fn base_slice(base: &str, pos: usize, n: usize) -> Result<&str> {
    let end = pos
        .checked_add(n)
        .filter(|end| *end <= base.len())
        .ok_or_else(|| Error::corrupt("Patch runs past the end of its base"))?;
    base.get(pos..end)
        .ok_or_else(|| Error::corrupt("Patch splits a UTF-8 character"))
}

pub fn encode_patch(ops: &[PatchOp]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ops)?)
}

pub fn decode_patch(bytes: &[u8]) -> Result<Vec<PatchOp>> {
    serde_json::from_slice(bytes).map_err(|e| Error::corrupt(format!("Unreadable patch: {}", e)))
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupt(format!("Unreadable compressed payload: {}", e)))?;
    Ok(out)
}

pub fn decompress_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(decompress(bytes)?)
        .map_err(|e| Error::corrupt(format!("Payload is not UTF-8: {}", e)))
}

/// Consecutive lines grouped by change kind, for timeline display
pub fn line_changes(old: &str, new: &str) -> Vec<DiffChange> {
    let diff = TextDiff::from_lines(old, new);
    let mut changes: Vec<DiffChange> = Vec::new();

    for change in diff.iter_all_changes() {
        let kind = match change.tag() {
            ChangeTag::Equal => DiffChangeKind::Equal,
            ChangeTag::Insert => DiffChangeKind::Added,
            ChangeTag::Delete => DiffChangeKind::Removed,
        };
        match changes.last_mut() {
            Some(last) if last.kind == kind => {
                last.value.push_str(change.value());
                last.count += 1;
            }
            _ => changes.push(DiffChange {
                kind,
                value: change.value().to_string(),
                count: 1,
            }),
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use notevault_core::DiffStats;

    #[test]
    fn test_patch_reproduces_target_exactly() {
        let cases = [
            ("", "hello"),
            ("hello", ""),
            ("a\nb\nc\n", "a\nB\nc\nd\n"),
            ("no trailing newline", "no trailing newline\nnow there is\n"),
            ("crlf\r\nlines\r\n", "crlf\r\nchanged\r\n"),
            ("naïve café\n", "naïve café ☕\n"),
        ];
        for (old, new) in cases {
            let patch = make_patch(old, new);
            assert_eq!(apply_patch(old, &patch).unwrap(), new, "{:?} -> {:?}", old, new);
        }
    }

    #[test]
    fn test_adjacent_ops_are_merged() {
        let patch = make_patch("a\nb\nc\n", "x\ny\nz\n");
        assert_eq!(
            patch,
            vec![PatchOp::Delete(6), PatchOp::Insert("x\ny\nz\n".into())]
        );
    }

    #[test]
    fn test_patch_against_wrong_base_fails() {
        let patch = make_patch("one\ntwo\n", "one\n2\n");
        assert!(apply_patch("one\n", &patch).is_err());
        assert!(apply_patch("one\ntwo\nthree\n", &patch).is_err());
    }

    #[test]
    fn test_patch_encoding_shape() {
        let json = String::from_utf8(
            encode_patch(&[PatchOp::Retain(3), PatchOp::Insert("x".into())]).unwrap(),
        )
        .unwrap();
        assert_eq!(json, r#"[{"retain":3},{"insert":"x"}]"#);
        assert!(decode_patch(b"not json").is_err());
    }

    #[test]
    fn test_compression() {
        let text = "line\n".repeat(200);
        let packed = compress(text.as_bytes()).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress_text(&packed).unwrap(), text);
        assert!(decompress(b"garbage").is_err());
    }

    #[test]
    fn test_line_changes_grouping() {
        let changes = line_changes("a\nb\nc\n", "a\nx\ny\nc\n");
        let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DiffChangeKind::Equal,
                DiffChangeKind::Removed,
                DiffChangeKind::Added,
                DiffChangeKind::Equal
            ]
        );
        assert_eq!(changes[2].value, "x\ny\n");
        let stats = DiffStats::of(&changes);
        assert_eq!((stats.additions, stats.deletions), (2, 1));
    }
}
