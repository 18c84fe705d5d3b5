//! Splits an object into the ranges a transfer executes

use crate::transfer::error::{Result, TransferError};
use serde::Serialize;

/// Upper bound on parts accepted by S3-compatible servers
pub const DEFAULT_MAX_PARTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One request carries the whole object
    Simple,
    /// Concurrent parts, each its own request
    Multipart,
}

/// Byte range `[start, end)` of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartRange {
    /// 1-based
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
}

impl PartRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub strategy: Strategy,
    pub size: u64,
    pub parts: Vec<PartRange>,
}

/// Plan a transfer of `size` bytes.
///
/// Objects up to `threshold` bytes (including empty ones) go in one request.
/// Larger objects are cut into contiguous `part_size` ranges, the last one
/// possibly shorter.
pub fn plan(size: u64, threshold: u64, part_size: u64, max_parts: u32) -> Result<TransferPlan> {
    if part_size == 0 {
        return Err(TransferError::InvalidArgument(
            "part size must be greater than zero".to_string(),
        ));
    }
    if max_parts == 0 {
        return Err(TransferError::InvalidArgument(
            "max parts must be greater than zero".to_string(),
        ));
    }

    if size <= threshold {
        return Ok(TransferPlan {
            strategy: Strategy::Simple,
            size,
            parts: vec![PartRange {
                part_number: 1,
                start: 0,
                end: size,
            }],
        });
    }

    let count = size.div_ceil(part_size);
    if count > u64::from(max_parts) {
        return Err(TransferError::PlanTooLarge {
            parts: count,
            max_parts,
        });
    }

    let parts = (0..count)
        .map(|i| {
            let start = i * part_size;
            PartRange {
                part_number: (i + 1) as u32,
                start,
                end: (start + part_size).min(size),
            }
        })
        .collect();

    Ok(TransferPlan {
        strategy: Strategy::Multipart,
        size,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_contiguous(plan: &TransferPlan) {
        let mut next = 0;
        for (i, part) in plan.parts.iter().enumerate() {
            assert_eq!(part.part_number as usize, i + 1);
            assert_eq!(part.start, next);
            assert!(part.end > part.start);
            next = part.end;
        }
        assert_eq!(next, plan.size);
    }

    #[test]
    fn test_small_object_is_single_part() {
        for size in [0, 1, 64 * MIB] {
            let plan = plan(size, 64 * MIB, 64 * MIB, DEFAULT_MAX_PARTS).unwrap();
            assert_eq!(plan.strategy, Strategy::Simple);
            assert_eq!(
                plan.parts,
                vec![PartRange {
                    part_number: 1,
                    start: 0,
                    end: size
                }]
            );
        }
    }

    #[test]
    fn test_150mb_in_64mb_parts() {
        let plan = plan(150 * MIB, 64 * MIB, 64 * MIB, DEFAULT_MAX_PARTS).unwrap();
        assert_eq!(plan.strategy, Strategy::Multipart);
        let sizes: Vec<u64> = plan.parts.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![64 * MIB, 64 * MIB, 22 * MIB]);
        assert_contiguous(&plan);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let plan = plan(4 * MIB, MIB, MIB, DEFAULT_MAX_PARTS).unwrap();
        assert_eq!(plan.parts.len(), 4);
        assert_contiguous(&plan);
    }

    #[test]
    fn test_parts_are_contiguous_for_odd_sizes() {
        for size in [MIB + 1, 7 * MIB + 3, 10 * MIB - 1] {
            let plan = plan(size, MIB, MIB, DEFAULT_MAX_PARTS).unwrap();
            assert_contiguous(&plan);
        }
    }

    #[test]
    fn test_too_many_parts() {
        let err = plan(10_001, 0, 1, DEFAULT_MAX_PARTS).unwrap_err();
        assert!(matches!(
            err,
            TransferError::PlanTooLarge {
                parts: 10_001,
                max_parts: 10_000
            }
        ));
        assert!(plan(10_000, 0, 1, DEFAULT_MAX_PARTS).is_ok());
    }

    #[test]
    fn test_zero_part_size_rejected() {
        assert!(matches!(
            plan(10, 100, 0, DEFAULT_MAX_PARTS),
            Err(TransferError::InvalidArgument(_))
        ));
    }
}
