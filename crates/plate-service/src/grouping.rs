//! Reading-order reconstruction for the characters of one plate.
//!
//! Characters are seeded in order of vertical center and split into rows by
//! a single greedy scan: a character joins the current row when its center
//! is within `row_threshold_fraction` of its own height from the center of
//! the character added to the row just before it. Rows are then sorted by
//! `x1` and concatenated top to bottom.
//!
//! Only the previous row member is compared, not a row anchor, so tolerance
//! can drift along a row of unevenly sized boxes. Outputs depend on this
//! exact rule; keep it unless parity with existing results can be dropped.

use common::plate_tasks::CharacterDetection;

pub const DEFAULT_ROW_THRESHOLD_FRACTION: f32 = 0.15;

/// Split characters into rows, top row first, each row sorted by `x1`
pub fn partition_rows(
    mut chars: Vec<CharacterDetection>,
    row_threshold_fraction: f32,
) -> Vec<Vec<CharacterDetection>> {
    if chars.is_empty() {
        return Vec::new();
    }

    // stable: ties keep detector order
    chars.sort_by(|a, b| {
        a.bbox
            .vertical_center()
            .total_cmp(&b.bbox.vertical_center())
    });

    let mut rows: Vec<Vec<CharacterDetection>> = Vec::new();
    let mut current_row: Vec<CharacterDetection> = Vec::new();

    for ch in chars {
        let joins_row = current_row.last().is_some_and(|prev| {
            let distance = (ch.bbox.vertical_center() - prev.bbox.vertical_center()).abs();
            distance < row_threshold_fraction * ch.bbox.height() as f32
        });

        if !joins_row && !current_row.is_empty() {
            rows.push(std::mem::take(&mut current_row));
        }
        current_row.push(ch);
    }
    rows.push(current_row);

    for row in &mut rows {
        row.sort_by_key(|ch| ch.bbox.x1);
    }

    rows
}

/// Characters in reading order: rows top to bottom, each left to right
pub fn group_characters(
    chars: Vec<CharacterDetection>,
    row_threshold_fraction: f32,
) -> Vec<CharacterDetection> {
    partition_rows(chars, row_threshold_fraction)
        .into_iter()
        .flatten()
        .collect()
}
