//! 주입식 클럭
//!
//! 스트림 타이머는 클럭 추상화 위에서 동작하므로
//! 테스트에서는 [`ManualClock`]으로 시간을 결정적으로 진행시킬 수 있다.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// 현재 시각 공급자
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// 실제 시스템 시계
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 수동 진행 시계 (결정적 시뮬레이션용)
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: RwLock::new(Instant::now()),
        }
    }

    /// 시간을 앞으로 진행
    pub fn advance(&self, duration: Duration) {
        *self.now.write() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.read()
    }
}
