/// One contiguous byte range of the source disk.
///
/// The planner only yields ranges; the data is read later by the chunk
/// tasks, so planning a multi-TB disk costs nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

pub const DEFAULT_CHUNK_SIZE_MB: u64 = 512;

/// Split `total_size` bytes into `ceil(total_size / chunk_bytes)` contiguous
/// ranges; only the final range may be short.
pub fn plan_chunks(total_size: u64, chunk_bytes: u64) -> Vec<ChunkPlan> {
    debug_assert!(chunk_bytes > 0);
    let mut out = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;
    while offset < total_size {
        let length = chunk_bytes.min(total_size - offset);
        out.push(ChunkPlan { index, offset, length });
        offset += length;
        index += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple() {
        let plans = plan_chunks(1024, 256);
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0], ChunkPlan { index: 0, offset: 0, length: 256 });
        assert_eq!(plans[3], ChunkPlan { index: 3, offset: 768, length: 256 });
    }

    #[test]
    fn short_tail() {
        let plans = plan_chunks(1000, 256);
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[3], ChunkPlan { index: 3, offset: 768, length: 232 });
        assert_eq!(plans.iter().map(|p| p.length).sum::<u64>(), 1000);
    }

    #[test]
    fn single_and_empty() {
        assert_eq!(plan_chunks(0, 256), vec![]);
        assert_eq!(
            plan_chunks(1, 256),
            vec![ChunkPlan { index: 0, offset: 0, length: 1 }]
        );
    }
}
