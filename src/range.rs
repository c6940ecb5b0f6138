//! 누락 구간 집합
//!
//! 청크 인덱스의 닫힌 구간 `[lo, hi]`들을 정렬된 상태로 보관한다.
//! 불변식: 구간들은 서로 겹치지 않고 인접하지도 않으며,
//! 모든 인덱스는 해당 스트림의 high mark보다 작다.

use crate::ChunkIndex;

/// 정렬된 disjoint 닫힌 구간 집합
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// 오름차순 정렬, 겹침/인접 없음
    ranges: Vec<(ChunkIndex, ChunkIndex)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 구간 목록으로부터 생성 (테스트/디코더 편의용)
    pub fn from_ranges(ranges: &[(ChunkIndex, ChunkIndex)]) -> Self {
        let mut set = Self::new();
        for &(lo, hi) in ranges {
            set.insert(lo, hi);
        }
        set
    }

    /// 구간 `[lo, hi]` 삽입
    ///
    /// 겹치거나 인접한 기존 구간과는 하나로 합쳐진다.
    /// ACK 디코더가 128 초과 run을 연속 바이트로 나눠 보내므로
    /// 인접 구간 병합은 디코드 round-trip에 필수이다.
    pub fn insert(&mut self, lo: ChunkIndex, hi: ChunkIndex) {
        debug_assert!(lo <= hi);

        let mut new_lo = lo;
        let mut new_hi = hi;

        // 병합 대상: [lo-1, hi+1]과 겹치는 모든 구간
        let merge_lo = lo.saturating_sub(1);
        let merge_hi = hi.saturating_add(1);

        let start = self.ranges.partition_point(|&(_, h)| h < merge_lo);
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].0 <= merge_hi {
            new_lo = new_lo.min(self.ranges[end].0);
            new_hi = new_hi.max(self.ranges[end].1);
            end += 1;
        }

        self.ranges.splice(start..end, [(new_lo, new_hi)]);
    }

    /// 인덱스 하나를 수신 처리
    ///
    /// 인덱스가 어느 구간에도 없으면 이미 채워진 중복 수신이므로 false.
    /// 구간 끝에 걸치면 한 칸 줄이고, 한 칸짜리 구간은 제거하며,
    /// 구간 내부면 둘로 쪼갠다.
    pub fn fill(&mut self, index: ChunkIndex) -> bool {
        let pos = self.ranges.partition_point(|&(_, h)| h < index);
        let Some(&(lo, hi)) = self.ranges.get(pos) else {
            return false;
        };
        if index < lo {
            return false;
        }

        if lo == hi {
            self.ranges.remove(pos);
        } else if index == lo {
            self.ranges[pos].0 = lo + 1;
        } else if index == hi {
            self.ranges[pos].1 = hi - 1;
        } else {
            self.ranges[pos] = (lo, index - 1);
            self.ranges.insert(pos + 1, (index + 1, hi));
        }
        true
    }

    /// 인덱스 포함 여부
    pub fn contains(&self, index: ChunkIndex) -> bool {
        let pos = self.ranges.partition_point(|&(_, h)| h < index);
        matches!(self.ranges.get(pos), Some(&(lo, _)) if lo <= index)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 구간 개수
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// 누락 인덱스 총수
    pub fn missing_count(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo) as usize + 1)
            .sum()
    }

    /// 구간 슬라이스 (오름차순)
    pub fn as_slice(&self) -> &[(ChunkIndex, ChunkIndex)] {
        &self.ranges
    }

    /// 누락 인덱스를 오름차순으로 펼침
    pub fn flatten(&self) -> Vec<ChunkIndex> {
        self.ranges
            .iter()
            .flat_map(|&(lo, hi)| lo..=hi)
            .collect()
    }
}
