// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sidecar notes emission: `<source stem>.tcno` files mapping
//! source file -> function -> block -> covered source lines.
//!
//! Indices are per-function block positions in selection order, which an
//! offline reader combines with the report file's block-to-name table to
//! recover absolute indices.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use inkwell::basic_block::BasicBlock;
use inkwell::module::Module;
use tinycoverage_format::{MAGIC_NOTES_UNIT, push_string, words_to_bytes};

use crate::di;
use crate::error::NotesError;
use crate::select;

/// Source lines covered by `block`: every non-debug instruction carrying a
/// location with a line greater than zero.
pub(crate) fn block_line_set(block: BasicBlock<'_>) -> BTreeSet<u32> {
    let mut lines = BTreeSet::new();
    for inst in block.get_instructions() {
        if select::is_debug_intrinsic(inst) {
            continue;
        }
        let line = di::instruction_line(inst);
        if line > 0 {
            lines.insert(line);
        }
    }
    lines
}

/// Accumulates one module's notes, grouped by each function's own source
/// file (functions defined in headers land under the header's name).
#[derive(Default)]
pub(crate) struct NotesBuilder {
    units: BTreeMap<String, BTreeMap<String, Vec<BTreeSet<u32>>>>,
}

impl NotesBuilder {
    pub(crate) fn clear(&mut self) {
        self.units.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Record one instrumented function: per-block line sets in selection
    /// order.
    pub(crate) fn record(&mut self, source: &str, function: &str, blocks: Vec<BTreeSet<u32>>) {
        self.units
            .entry(source.to_string())
            .or_default()
            .insert(function.to_string(), blocks);
    }

    fn encode(&self) -> Vec<u8> {
        let mut words = Vec::new();
        for (source, functions) in &self.units {
            words.push(MAGIC_NOTES_UNIT);
            push_string(&mut words, source.as_bytes());
            words.push(functions.len() as u32);
            for (name, blocks) in functions {
                push_string(&mut words, name.as_bytes());
                words.push(blocks.len() as u32);
                for lines in blocks {
                    words.push(lines.len() as u32);
                    words.extend(lines.iter().copied());
                }
            }
        }
        words_to_bytes(&words)
    }

    pub(crate) fn write_to(&self, path: &Path) -> Result<(), NotesError> {
        std::fs::write(path, self.encode()).map_err(|source| NotesError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `<notes_dir>/<module source stem>.tcno`. Falls back to the module
/// identifier when no source file name was recorded.
pub(crate) fn notes_path(notes_dir: &Path, module: &Module<'_>) -> PathBuf {
    let source = module.get_source_file_name().to_string_lossy().into_owned();
    let stem = Path::new(&source)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| module.get_name().to_string_lossy().into_owned());
    notes_dir.join(format!("{stem}.tcno"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tinycoverage_format::parse_notes;

    use super::NotesBuilder;

    fn lines(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn encode_groups_by_source_then_function() {
        let mut notes = NotesBuilder::default();
        notes.record("util.h", "helper", vec![lines(&[3])]);
        notes.record("main.c", "main", vec![lines(&[10, 11]), lines(&[])]);

        let units = parse_notes(&notes.encode()).unwrap();
        assert_eq!(units.len(), 2);
        // BTreeMap ordering: main.c before util.h
        assert_eq!(units[0].source, "main.c");
        assert_eq!(units[0].functions[0].name, "main");
        assert_eq!(units[0].functions[0].blocks, vec![vec![10, 11], vec![]]);
        assert_eq!(units[1].source, "util.h");
        assert_eq!(units[1].functions[0].blocks, vec![vec![3]]);
    }

    #[test]
    fn clear_resets_per_module_state() {
        let mut notes = NotesBuilder::default();
        notes.record("a.c", "f", vec![lines(&[1])]);
        assert!(!notes.is_empty());
        notes.clear();
        assert!(notes.is_empty());
    }
}
