//! 時刻ソース
//!
//! 鮮度計算で使用する現在時刻を注入可能にします。
//! テストでは`ManualClock`により時刻を任意に進められます。

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// 現在時刻を返すクロック
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// システム時刻をそのまま返すクロック
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 手動で時刻を進められるクロック
///
/// 鮮度・有効期限のテストで時間経過をシミュレートするために使用します。
#[allow(dead_code)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

#[allow(dead_code)]
impl ManualClock {
    /// 指定時刻で作成
    pub fn new(now: SystemTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// 時刻を設定
    pub fn set(&self, t: SystemTime) {
        *self.now.lock().unwrap() = t;
    }

    /// 時刻を進める
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}
