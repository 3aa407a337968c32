//! Calendar schedules for wall-clock timers.
//!
//! A schedule names some of minute / hour / day / week / month; the most
//! significant named field decides the period (every minute, hourly,
//! daily, weekly, monthly, yearly). Next-fire computation goes through
//! `localtime_r` / `mktime` so month lengths and DST shifts are resolved
//! by libc.

use std::mem;

/// Calendar fire rule. Unset fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CronSchedule {
    /// 0-59
    pub minute: Option<u8>,
    /// 0-23
    pub hour: Option<u8>,
    /// Day of month, 1-31
    pub day: Option<u8>,
    /// Day of week, 0-6 with Sunday as 0
    pub week: Option<u8>,
    /// 1-12
    pub month: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl CronSchedule {
    pub fn minutely() -> Self {
        Self::default()
    }

    pub fn hourly(minute: u8) -> Self {
        Self {
            minute: Some(minute),
            ..Self::default()
        }
    }

    pub fn daily(hour: u8, minute: u8) -> Self {
        Self {
            minute: Some(minute),
            hour: Some(hour),
            ..Self::default()
        }
    }

    pub fn weekly(week: u8, hour: u8, minute: u8) -> Self {
        Self {
            minute: Some(minute),
            hour: Some(hour),
            week: Some(week),
            ..Self::default()
        }
    }

    pub fn monthly(day: u8, hour: u8, minute: u8) -> Self {
        Self {
            minute: Some(minute),
            hour: Some(hour),
            day: Some(day),
            ..Self::default()
        }
    }

    fn period(&self) -> Period {
        if self.month.is_some() {
            Period::Yearly
        } else if self.day.is_some() {
            Period::Monthly
        } else if self.week.is_some() {
            Period::Weekly
        } else if self.hour.is_some() {
            Period::Daily
        } else if self.minute.is_some() {
            Period::Hourly
        } else {
            Period::Minutely
        }
    }

    /// Next fire time strictly after `now` (unix seconds, local time).
    pub fn next_after(&self, now: i64) -> i64 {
        let mut tm = local_tm(now);
        tm.tm_sec = 0;
        let period = self.period();

        match period {
            Period::Minutely => {
                let t = to_time(&mut tm);
                if t <= now {
                    t + 60
                } else {
                    t
                }
            }
            Period::Hourly => {
                tm.tm_min = self.minute.unwrap_or(0) as i32;
                let t = to_time(&mut tm);
                if t <= now {
                    t + 3600
                } else {
                    t
                }
            }
            Period::Daily => {
                tm.tm_min = self.minute.unwrap_or(0) as i32;
                tm.tm_hour = self.hour.unwrap_or(0) as i32;
                let t = to_time(&mut tm);
                if t <= now {
                    t + 86400
                } else {
                    t
                }
            }
            Period::Weekly => {
                let wday = tm.tm_wday as i64;
                tm.tm_min = self.minute.unwrap_or(0) as i32;
                tm.tm_hour = self.hour.unwrap_or(0) as i32;
                let t = to_time(&mut tm);
                let ahead = (self.week.unwrap_or(0) as i64 - wday).rem_euclid(7);
                let t = t + ahead * 86400;
                if t <= now {
                    t + 7 * 86400
                } else {
                    t
                }
            }
            Period::Monthly => {
                tm.tm_min = self.minute.unwrap_or(0) as i32;
                tm.tm_hour = self.hour.unwrap_or(0) as i32;
                tm.tm_mday = self.day.unwrap_or(1) as i32;
                let t = to_time(&mut tm.clone());
                if t <= now {
                    tm.tm_mon += 1;
                    to_time(&mut tm)
                } else {
                    t
                }
            }
            Period::Yearly => {
                tm.tm_min = self.minute.unwrap_or(0) as i32;
                tm.tm_hour = self.hour.unwrap_or(0) as i32;
                tm.tm_mday = self.day.unwrap_or(1) as i32;
                tm.tm_mon = self.month.unwrap_or(1) as i32 - 1;
                let t = to_time(&mut tm.clone());
                if t <= now {
                    tm.tm_year += 1;
                    to_time(&mut tm)
                } else {
                    t
                }
            }
        }
    }
}

fn local_tm(t: i64) -> libc::tm {
    let secs = t as libc::time_t;
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    unsafe {
        libc::localtime_r(&secs, &mut tm);
    }
    tm
}

fn to_time(tm: &mut libc::tm) -> i64 {
    // Let mktime resolve DST for the shifted fields.
    tm.tm_isdst = -1;
    unsafe { libc::mktime(tm) as i64 }
}
