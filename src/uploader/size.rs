// 分片尺寸计算
//
// 分片规则：
// - 第 n 片起始字节 = n × chunk_size
// - 强制分片大小时：分片数向上取整，最后一片可能小于 chunk_size
// - 非强制时：分片数向下取整，不足一片的尾部并入最后一片
// - 至少 1 片（空文件也是 1 片）

use std::ops::Range;

/// 小文件阈值: 50MB
pub const SMALL_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// 中等文件阈值: 500MB
pub const MEDIUM_FILE_THRESHOLD: u64 = 500 * 1024 * 1024;

/// 小文件分片大小: 2MB
pub const SMALL_FILE_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 中等文件分片大小: 5MB
pub const MEDIUM_FILE_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 大文件分片大小: 10MB
pub const LARGE_FILE_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 计算分片数量
///
/// # 参数
/// * `file_size` - 文件大小
/// * `chunk_size` - 分片大小（必须大于 0）
/// * `force_chunk_size` - 是否强制分片大小
pub fn chunk_count(file_size: u64, chunk_size: u64, force_chunk_size: bool) -> usize {
    let count = if force_chunk_size {
        file_size.div_ceil(chunk_size)
    } else {
        file_size / chunk_size
    };
    count.max(1) as usize
}

/// 计算第 `offset` 片的结束字节（不含）
pub fn compute_end_byte(offset: usize, chunk_size: u64, file_size: u64, force_chunk_size: bool) -> u64 {
    let theoretical_end = (offset as u64 + 1).saturating_mul(chunk_size);
    let mut end_byte = file_size.min(theoretical_end);

    // 尾部不足一片时并入当前片
    if file_size - end_byte < chunk_size && !force_chunk_size {
        end_byte = file_size;
    }

    end_byte
}

/// 计算全部分片的字节范围
pub fn chunk_ranges(file_size: u64, chunk_size: u64, force_chunk_size: bool) -> Vec<Range<u64>> {
    (0..chunk_count(file_size, chunk_size, force_chunk_size))
        .map(|offset| {
            let start = offset as u64 * chunk_size;
            let end = compute_end_byte(offset, chunk_size, file_size, force_chunk_size);
            start..end
        })
        .collect()
}

/// 根据文件大小选择分片大小
pub fn optimal_chunk_size(file_size: u64) -> u64 {
    if file_size < SMALL_FILE_THRESHOLD {
        SMALL_FILE_CHUNK_SIZE
    } else if file_size < MEDIUM_FILE_THRESHOLD {
        MEDIUM_FILE_CHUNK_SIZE
    } else {
        LARGE_FILE_CHUNK_SIZE
    }
}

/// 根据网络速度等级选择并发分片数
///
/// `network_speed` 是粗略的速度等级（Mbps 量级），不是精确测速结果
pub fn optimal_concurrency(network_speed: u32) -> usize {
    match network_speed {
        0..=5 => 4,   // 低速网络
        6..=10 => 6,  // 中速网络
        _ => 8,       // 高速网络
    }
}

/// 格式化字节大小
pub fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size_f = size as f64;
    if size_f < KB {
        format!("{} bytes", size)
    } else if size_f < MB {
        format!("{:.0} KB", size_f / KB)
    } else if size_f < GB {
        format!("{:.1} MB", size_f / MB)
    } else {
        format!("{:.1} GB", size_f / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_forced_chunk_size_keeps_short_tail() {
        let ranges = chunk_ranges(12_000_000, 5_000_000, true);
        assert_eq!(
            ranges,
            vec![0..5_000_000, 5_000_000..10_000_000, 10_000_000..12_000_000]
        );
    }

    #[test]
    fn test_unforced_small_file_is_single_chunk() {
        let ranges = chunk_ranges(4_800_000, 5_000_000, false);
        assert_eq!(ranges, vec![0..4_800_000]);
    }

    #[test]
    fn test_unforced_tail_merges_into_last_chunk() {
        let ranges = chunk_ranges(12_000_000, 5_000_000, false);
        assert_eq!(ranges, vec![0..5_000_000, 5_000_000..12_000_000]);
    }

    #[test]
    fn test_exact_multiple() {
        assert_eq!(chunk_count(10_000_000, 5_000_000, true), 2);
        assert_eq!(chunk_count(10_000_000, 5_000_000, false), 2);
        assert_eq!(
            chunk_ranges(10_000_000, 5_000_000, false),
            vec![0..5_000_000, 5_000_000..10_000_000]
        );
    }

    #[test]
    fn test_empty_file_has_one_empty_chunk() {
        assert_eq!(chunk_ranges(0, 1024, true), vec![0..0]);
        assert_eq!(chunk_ranges(0, 1024, false), vec![0..0]);
    }

    #[test]
    fn test_optimal_chunk_size() {
        assert_eq!(optimal_chunk_size(10 * 1024 * 1024), SMALL_FILE_CHUNK_SIZE);
        assert_eq!(optimal_chunk_size(SMALL_FILE_THRESHOLD), MEDIUM_FILE_CHUNK_SIZE);
        assert_eq!(optimal_chunk_size(2 * 1024 * 1024 * 1024), LARGE_FILE_CHUNK_SIZE);
    }

    #[test]
    fn test_optimal_concurrency() {
        assert_eq!(optimal_concurrency(3), 4);
        assert_eq!(optimal_concurrency(8), 6);
        assert_eq!(optimal_concurrency(15), 8);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_file(
            file_size in 0u64..50_000_000,
            chunk_size in 1u64..10_000_000,
            force in any::<bool>(),
        ) {
            let ranges = chunk_ranges(file_size, chunk_size, force);
            prop_assert_eq!(ranges.len(), chunk_count(file_size, chunk_size, force));
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, file_size);

            let total: u64 = ranges.iter().map(|r| r.end - r.start).sum();
            prop_assert_eq!(total, file_size);

            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }
}
