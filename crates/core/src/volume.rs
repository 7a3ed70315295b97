use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chapters per volume must be at least this many when a novel is partitioned.
pub const MIN_CHAPTERS_PER_VOLUME: u32 = 5;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("总章节数必须大于0")]
    NoChapters,
    #[error("分卷时总章节数必须是5的倍数（当前：{target_chapters}）")]
    NotMultipleOfFive { target_chapters: u32 },
    #[error("分卷数 {volume_count} 超出范围（2 - {max}）")]
    TooManyVolumes { volume_count: u32, max: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRange {
    pub volume: u32,
    pub start_chapter: u32,
    pub end_chapter: u32,
}

impl VolumeRange {
    pub fn contains(&self, chapter: u32) -> bool {
        (self.start_chapter..=self.end_chapter).contains(&chapter)
    }

    pub fn len(&self) -> u32 {
        self.end_chapter + 1 - self.start_chapter
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// `volume_count` of 0 or 1 means the novel is not partitioned.
pub fn validate_volume_config(target_chapters: u32, volume_count: u32) -> Result<(), VolumeError> {
    if target_chapters == 0 {
        return Err(VolumeError::NoChapters);
    }
    if volume_count <= 1 {
        return Ok(());
    }
    if target_chapters % MIN_CHAPTERS_PER_VOLUME != 0 {
        return Err(VolumeError::NotMultipleOfFive { target_chapters });
    }
    let max = target_chapters / MIN_CHAPTERS_PER_VOLUME;
    if volume_count > max {
        return Err(VolumeError::TooManyVolumes { volume_count, max });
    }
    Ok(())
}

/// Splits `1..=target_chapters` into contiguous volumes.
///
/// Every volume except the last gets `round_down_to_5(target / volume_count)`
/// chapters; the last one takes the remainder. A zero base size collapses to
/// a single volume.
pub fn calculate_volume_ranges(
    target_chapters: u32,
    volume_count: u32,
) -> Result<Vec<VolumeRange>, VolumeError> {
    validate_volume_config(target_chapters, volume_count)?;
    if volume_count <= 1 {
        return Ok(vec![single_volume(target_chapters)]);
    }

    let base = (target_chapters / volume_count) / MIN_CHAPTERS_PER_VOLUME * MIN_CHAPTERS_PER_VOLUME;
    if base == 0 {
        return Ok(vec![single_volume(target_chapters)]);
    }

    let mut ranges = Vec::with_capacity(volume_count as usize);
    let mut start = 1;
    for volume in 1..=volume_count {
        let end = if volume == volume_count {
            target_chapters
        } else {
            start + base - 1
        };
        ranges.push(VolumeRange {
            volume,
            start_chapter: start,
            end_chapter: end,
        });
        start = end + 1;
    }
    Ok(ranges)
}

fn single_volume(target_chapters: u32) -> VolumeRange {
    VolumeRange {
        volume: 1,
        start_chapter: 1,
        end_chapter: target_chapters,
    }
}

/// Volume holding `chapter`. Chapters past the last range belong to the last
/// volume; an empty plan yields volume 1.
pub fn get_volume_number(chapter: u32, ranges: &[VolumeRange]) -> u32 {
    ranges
        .iter()
        .find(|range| range.contains(chapter))
        .or_else(|| ranges.last())
        .map(|range| range.volume)
        .unwrap_or(1)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumePlan {
    ranges: Vec<VolumeRange>,
    partitioned: bool,
}

impl VolumePlan {
    pub fn new(target_chapters: u32, volume_count: u32) -> Result<Self, VolumeError> {
        let ranges = calculate_volume_ranges(target_chapters, volume_count)?;
        Ok(Self {
            partitioned: volume_count > 1 && ranges.len() > 1,
            ranges,
        })
    }

    pub fn ranges(&self) -> &[VolumeRange] {
        &self.ranges
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn volume_count(&self) -> u32 {
        self.ranges.len() as u32
    }

    pub fn target_chapters(&self) -> u32 {
        self.ranges.last().map(|range| range.end_chapter).unwrap_or(0)
    }

    pub fn volume_of(&self, chapter: u32) -> u32 {
        get_volume_number(chapter, &self.ranges)
    }

    pub fn range(&self, volume: u32) -> Option<&VolumeRange> {
        self.ranges.iter().find(|range| range.volume == volume)
    }

    /// `Some(volume)` when `chapter` closes a volume of a partitioned novel.
    pub fn closes_volume(&self, chapter: u32) -> Option<u32> {
        if !self.partitioned {
            return None;
        }
        self.ranges
            .iter()
            .find(|range| range.end_chapter == chapter)
            .map(|range| range.volume)
    }

    pub fn describe(&self) -> String {
        if !self.partitioned {
            return "（未分卷）".to_string();
        }
        self.ranges
            .iter()
            .map(|range| {
                format!(
                    "第{}卷：第{}章 - 第{}章（共{}章）",
                    range.volume,
                    range.start_chapter,
                    range.end_chapter,
                    range.len()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_chapters_in_three_volumes() {
        let ranges = calculate_volume_ranges(100, 3).unwrap();
        let spans: Vec<_> = ranges
            .iter()
            .map(|r| (r.start_chapter, r.end_chapter))
            .collect();
        assert_eq!(spans, vec![(1, 30), (31, 60), (61, 100)]);
    }

    #[test]
    fn unpartitioned_accepts_any_chapter_count() {
        assert!(validate_volume_config(23, 0).is_ok());
        assert!(validate_volume_config(23, 1).is_ok());
        assert_eq!(
            validate_volume_config(23, 2),
            Err(VolumeError::NotMultipleOfFive { target_chapters: 23 })
        );
        assert_eq!(
            validate_volume_config(20, 5),
            Err(VolumeError::TooManyVolumes {
                volume_count: 5,
                max: 4
            })
        );
    }

    #[test]
    fn valid_configurations_tile_every_chapter() {
        for target in (5..=200).step_by(5) {
            for volume_count in 0..=target / 5 {
                let ranges = calculate_volume_ranges(target, volume_count).unwrap();
                let expected = volume_count.max(1) as usize;
                assert_eq!(ranges.len(), expected, "target={target} vc={volume_count}");
                assert_eq!(ranges[0].start_chapter, 1);
                assert_eq!(ranges.last().unwrap().end_chapter, target);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end_chapter + 1, pair[1].start_chapter);
                }
                for (index, range) in ranges.iter().enumerate() {
                    assert!(range.start_chapter <= range.end_chapter);
                    if index + 1 < ranges.len() {
                        assert_eq!(range.len() % 5, 0);
                    }
                }
            }
        }
    }

    #[test]
    fn chapter_lookup_clamps_to_last_volume() {
        let plan = VolumePlan::new(20, 2).unwrap();
        assert_eq!(plan.volume_of(1), 1);
        assert_eq!(plan.volume_of(10), 1);
        assert_eq!(plan.volume_of(11), 2);
        assert_eq!(plan.volume_of(99), 2);
        assert_eq!(get_volume_number(3, &[]), 1);
    }

    #[test]
    fn closes_volume_only_when_partitioned() {
        let plan = VolumePlan::new(20, 2).unwrap();
        assert_eq!(plan.closes_volume(10), Some(1));
        assert_eq!(plan.closes_volume(20), Some(2));
        assert_eq!(plan.closes_volume(11), None);

        let single = VolumePlan::new(20, 0).unwrap();
        assert_eq!(single.closes_volume(20), None);
        assert_eq!(single.describe(), "（未分卷）");
    }
}
