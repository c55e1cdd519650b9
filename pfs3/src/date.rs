//! AmigaDOS时间戳

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use binrw::binrw;

/// 1970-01-01 到 1978-01-01 的秒数
const AMIGA_EPOCH_OFFSET: u64 = 2922 * 86400;

const TICKS_PER_SECOND: u64 = 50;

/// 自1978-01-01起的天数、当天分钟数、当分钟的tick数（每秒50个）
#[binrw]
#[brw(big)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateStamp {
    pub days: u16,
    pub minute: u16,
    pub tick: u16,
}

impl DateStamp {
    pub const fn new(days: u16, minute: u16, tick: u16) -> Self {
        Self { days, minute, tick }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// 早于纪元的时间记为零，超出范围的天数饱和
    pub fn from_system_time(time: SystemTime) -> Self {
        let Ok(since_unix) = time.duration_since(UNIX_EPOCH) else {
            return Self::default();
        };
        let Some(since_amiga) = since_unix
            .as_secs()
            .checked_sub(AMIGA_EPOCH_OFFSET)
        else {
            return Self::default();
        };

        let days = since_amiga / 86400;
        let rest = since_amiga % 86400;
        let tick = u64::from(since_unix.subsec_millis()) * TICKS_PER_SECOND / 1000
            + (rest % 60) * TICKS_PER_SECOND;

        Self {
            days: days.min(u64::from(u16::MAX)) as u16,
            minute: (rest / 60) as u16,
            tick: tick as u16,
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        let secs = AMIGA_EPOCH_OFFSET
            + u64::from(self.days) * 86400
            + u64::from(self.minute) * 60
            + u64::from(self.tick) / TICKS_PER_SECOND;
        let millis = u64::from(self.tick) % TICKS_PER_SECOND * 1000 / TICKS_PER_SECOND;

        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(millis)
    }
}
