//! Byte-for-byte comparison of two firmware images.

use common::{DiffKind, DiffRegion, FirmwareDiff};

/// Most regions an operator can usefully read; the scan stops collecting
/// (but keeps counting bytes) once the cap is reached.
pub const MAX_REGIONS: usize = 100;

/// Scans the shorter prefix for contiguous changed runs, then closes with a
/// single `added`/`removed` region covering the length tail.
pub fn compare(a: &[u8], b: &[u8]) -> FirmwareDiff {
    let common_len = a.len().min(b.len());
    let mut regions: Vec<DiffRegion> = Vec::new();
    let mut changed_run: Option<(usize, usize)> = None; // (offset, len)

    let mut push_run = |regions: &mut Vec<DiffRegion>, run: Option<(usize, usize)>| {
        if let Some((offset, length)) = run {
            if regions.len() < MAX_REGIONS {
                regions.push(DiffRegion {
                    kind: DiffKind::Changed,
                    offset: offset as u64,
                    length: length as u64,
                });
            }
        }
    };

    for i in 0..common_len {
        if a[i] != b[i] {
            changed_run = match changed_run {
                Some((offset, len)) => Some((offset, len + 1)),
                None => Some((i, 1)),
            };
        } else {
            push_run(&mut regions, changed_run.take());
        }
    }
    push_run(&mut regions, changed_run.take());

    let mut added_bytes = 0u64;
    let mut removed_bytes = 0u64;
    if b.len() > a.len() {
        added_bytes = (b.len() - a.len()) as u64;
        if regions.len() < MAX_REGIONS {
            regions.push(DiffRegion {
                kind: DiffKind::Added,
                offset: a.len() as u64,
                length: added_bytes,
            });
        }
    } else if a.len() > b.len() {
        removed_bytes = (a.len() - b.len()) as u64;
        if regions.len() < MAX_REGIONS {
            regions.push(DiffRegion {
                kind: DiffKind::Removed,
                offset: b.len() as u64,
                length: removed_bytes,
            });
        }
    }

    FirmwareDiff {
        size_diff: b.len() as i64 - a.len() as i64,
        added_bytes,
        removed_bytes,
        changed_regions: regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs_have_no_regions() {
        let diff = compare(b"firmware", b"firmware");
        assert_eq!(diff.size_diff, 0);
        assert_eq!(diff.added_bytes, 0);
        assert_eq!(diff.removed_bytes, 0);
        assert!(diff.changed_regions.is_empty());
    }

    #[test]
    fn test_appended_suffix_is_one_added_region() {
        let a = b"base image";
        let b = b"base image-suffix";
        let diff = compare(a, b);

        assert_eq!(diff.size_diff, 7);
        assert_eq!(diff.added_bytes, 7);
        assert_eq!(diff.changed_regions.len(), 1);
        assert_eq!(
            diff.changed_regions[0],
            DiffRegion {
                kind: DiffKind::Added,
                offset: a.len() as u64,
                length: 7,
            }
        );
    }

    #[test]
    fn test_truncation_is_one_removed_region() {
        let diff = compare(b"full image", b"full");
        assert_eq!(diff.size_diff, -6);
        assert_eq!(diff.removed_bytes, 6);
        assert_eq!(diff.changed_regions.len(), 1);
        assert_eq!(diff.changed_regions[0].kind, DiffKind::Removed);
        assert_eq!(diff.changed_regions[0].offset, 4);
    }

    #[test]
    fn test_contiguous_changes_coalesce() {
        let a = b"aaaaaaaa";
        let b = b"aaXXaaYa";
        let diff = compare(a, b);

        assert_eq!(
            diff.changed_regions,
            vec![
                DiffRegion {
                    kind: DiffKind::Changed,
                    offset: 2,
                    length: 2
                },
                DiffRegion {
                    kind: DiffKind::Changed,
                    offset: 6,
                    length: 1
                },
            ]
        );
    }

    #[test]
    fn test_region_list_is_capped() {
        // Alternating bytes: every even offset differs.
        let a: Vec<u8> = (0..400).map(|_| 0u8).collect();
        let b: Vec<u8> = (0..400).map(|i| if i % 2 == 0 { 1u8 } else { 0u8 }).collect();
        let diff = compare(&a, &b);
        assert_eq!(diff.changed_regions.len(), MAX_REGIONS);
    }
}
