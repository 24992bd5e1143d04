// Neighborhood module
// Maps a cursor position to the frames that should be resident around it.

use crate::formats::SourceError;

/// Indices to keep resident for `position`: `position, position + 1, ..., position + window_radius`,
/// wrapped modulo `frame_count`, nearest first.
///
/// A radius at or beyond `frame_count` wraps onto indices already listed; callers that need
/// membership tests should collect into a set.
pub fn compute_targets(
    position: usize,
    window_radius: usize,
    frame_count: usize,
) -> Result<Vec<usize>, SourceError> {
    if frame_count == 0 {
        return Err(SourceError::InvalidSource("frame count is zero".to_string()));
    }
    Ok((0..=window_radius)
        .map(|offset| (position % frame_count + offset % frame_count) % frame_count)
        .collect())
}
