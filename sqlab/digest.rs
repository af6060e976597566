use sha2::{Digest, Sha256};

use crate::resultset::{ColumnDef, ResultSet};

/// Column predicate for digesting: `true` keeps the column. `None` keeps
/// everything.
pub type ColumnFilter<'a> = &'a dyn Fn(&ColumnDef) -> bool;

fn kept_columns(rs: &ResultSet, filter: Option<ColumnFilter>) -> Option<Vec<usize>> {
    let f = filter?;
    if rs.cols.is_empty() {
        // no metadata, nothing to filter on
        return None;
    }
    Some(
        rs.cols
            .iter()
            .enumerate()
            .filter(|(_, c)| f(c))
            .map(|(i, _)| i)
            .collect(),
    )
}

fn feed_cell(h: &mut Sha256, cell: &Option<Vec<u8>>) {
    match cell {
        None => h.update(u64::MAX.to_le_bytes()),
        Some(b) => {
            h.update((b.len() as u64).to_le_bytes());
            h.update(b);
        }
    }
}

fn feed_row(h: &mut Sha256, row: &[Option<Vec<u8>>], kept: Option<&[usize]>) {
    match kept {
        None => {
            for cell in row {
                feed_cell(h, cell);
            }
        }
        Some(idx) => {
            for &i in idx {
                if let Some(cell) = row.get(i) {
                    feed_cell(h, cell);
                }
            }
        }
    }
}

/// Row-order-sensitive digest: all rows streamed through one hash.
pub fn ordered_digest(rs: &ResultSet, filter: Option<ColumnFilter>) -> String {
    let kept = kept_columns(rs, filter);
    let mut h = Sha256::new();
    for row in &rs.rows {
        feed_row(&mut h, row, kept.as_deref());
    }
    hex::encode(h.finalize())
}

/// Row-order-insensitive digest: one hash per row, per-row digests sorted
/// lexicographically, then hashed together. Duplicate rows stay significant.
pub fn unordered_digest(rs: &ResultSet, filter: Option<ColumnFilter>) -> String {
    let kept = kept_columns(rs, filter);
    let mut row_digests: Vec<[u8; 32]> = rs
        .rows
        .iter()
        .map(|row| {
            let mut h = Sha256::new();
            feed_row(&mut h, row, kept.as_deref());
            h.finalize().into()
        })
        .collect();
    row_digests.sort_unstable();
    let mut h = Sha256::new();
    for d in &row_digests {
        h.update(d);
    }
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resultset::rs;

    #[test]
    fn unordered_digest_is_idempotent_and_order_invariant() {
        let a = rs(&[&[Some("1"), Some("x")], &[Some("2"), None]]);
        let b = rs(&[&[Some("2"), None], &[Some("1"), Some("x")]]);
        assert_eq!(unordered_digest(&a, None), unordered_digest(&a, None));
        assert_eq!(unordered_digest(&a, None), unordered_digest(&b, None));
        assert_ne!(ordered_digest(&a, None), ordered_digest(&b, None));
    }

    #[test]
    fn duplicate_rows_are_not_collapsed() {
        let once = rs(&[&[Some("1")]]);
        let twice = rs(&[&[Some("1")], &[Some("1")]]);
        assert_ne!(unordered_digest(&once, None), unordered_digest(&twice, None));
    }

    #[test]
    fn null_differs_from_empty_string() {
        let null = rs(&[&[None]]);
        let empty = rs(&[&[Some("")]]);
        assert_ne!(ordered_digest(&null, None), ordered_digest(&empty, None));
    }

    #[test]
    fn cell_boundaries_are_unambiguous() {
        let ab = rs(&[&[Some("ab"), Some("c")]]);
        let a_bc = rs(&[&[Some("a"), Some("bc")]]);
        assert_ne!(ordered_digest(&ab, None), ordered_digest(&a_bc, None));
    }

    #[test]
    fn filter_excludes_columns_from_both_modes() {
        let mut a = rs(&[&[Some("1"), Some("0.30000001")]]);
        let mut b = rs(&[&[Some("1"), Some("0.3")]]);
        for r in [&mut a, &mut b] {
            r.cols = vec![
                crate::resultset::ColumnDef::new("id", "LONG"),
                crate::resultset::ColumnDef::new("f", "DOUBLE"),
            ];
        }
        let filter: ColumnFilter = &|c| c.type_name != "DOUBLE";
        assert_eq!(
            ordered_digest(&a, Some(filter)),
            ordered_digest(&b, Some(filter))
        );
        assert_eq!(
            unordered_digest(&a, Some(filter)),
            unordered_digest(&b, Some(filter))
        );
        assert_ne!(ordered_digest(&a, None), ordered_digest(&b, None));
    }
}
