use crate::core::model::SegmentRange;

/// Splits `content_length` bytes into `thread_num` contiguous segments.
///
/// The last segment is left open-ended. An unknown length (or a single
/// thread) yields one open-ended segment covering the whole body.
pub fn plan_segments(content_length: i64, thread_num: usize) -> Vec<SegmentRange> {
    let whole = vec![SegmentRange { index: 0, start: 0, end: None }];
    if content_length <= 0 || thread_num <= 1 {
        return whole;
    }

    let total = content_length as u64;
    let count = (thread_num as u64).min(total);
    let block = total / count;

    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * block;
        let end = if i == count - 1 { None } else { Some(start + block - 1) };
        segments.push(SegmentRange { index: i as usize, start, end });
    }
    segments
}
