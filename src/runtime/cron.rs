// src/runtime/cron.rs

//! Cron expressions: `[second] minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, a number, `a-b`, a comma separated list of those, and
//! an optional `/step`. `?` is accepted for day-of-month and day-of-week and means `*`.
//! Day-of-week runs 0 (Sunday) to 6. Both day fields must match for a day to be picked.

use crate::error::RpcError;

use std::str::FromStr;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike};

/// How far ahead `next` searches before giving up on an unsatisfiable expression.
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpr {
  sec: u64,
  min: u64,
  hour: u64,
  dom: u64,
  month: u64,
  dow: u64,
}

fn invalid(expr: &str, why: impl std::fmt::Display) -> RpcError {
  RpcError::InvalidCron(format!("{expr:?}: {why}"))
}

fn parse_number(expr: &str, text: &str) -> Result<u32, RpcError> {
  text
    .parse::<u32>()
    .map_err(|_| invalid(expr, format_args!("{text:?} is not a number")))
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32, allow_any: bool) -> Result<u64, RpcError> {
  let mut bits = 0u64;
  for part in field.split(',') {
    let (range, step) = match part.split_once('/') {
      Some((range, step)) => (range, Some(parse_number(expr, step)?)),
      None => (part, None),
    };
    if step == Some(0) {
      return Err(invalid(expr, "step must be positive"));
    }

    let (start, end) = if range == "*" || (allow_any && range == "?") {
      (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
      (parse_number(expr, a)?, parse_number(expr, b)?)
    } else {
      let start = parse_number(expr, range)?;
      // "5/15" runs from 5 to the end of the range.
      (start, if step.is_some() { max } else { start })
    };

    if start < min || end > max || start > end {
      return Err(invalid(expr, format_args!("{part:?} outside {min}-{max}")));
    }
    for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
      bits |= 1 << value;
    }
  }
  Ok(bits)
}

fn has(bits: u64, value: u32) -> bool {
  bits & (1 << value) != 0
}

impl CronExpr {
  pub fn parse(expr: &str) -> Result<Self, RpcError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let fields = match fields.len() {
      5 => {
        let mut with_sec = vec!["0"];
        with_sec.extend(fields);
        with_sec
      }
      6 => fields,
      n => return Err(invalid(expr, format_args!("expected 5 or 6 fields, found {n}"))),
    };

    Ok(Self {
      sec: parse_field(expr, fields[0], 0, 59, false)?,
      min: parse_field(expr, fields[1], 0, 59, false)?,
      hour: parse_field(expr, fields[2], 0, 23, false)?,
      dom: parse_field(expr, fields[3], 1, 31, true)?,
      month: parse_field(expr, fields[4], 1, 12, false)?,
      dow: parse_field(expr, fields[5], 0, 6, true)?,
    })
  }

  /// The first matching instant strictly after `after`, at whole-second precision.
  pub fn next(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut t = after.with_nanosecond(0)? + TimeDelta::seconds(1);
    let year_limit = t.year() + SEARCH_YEARS;

    'search: loop {
      if t.year() > year_limit {
        return None;
      }

      while !has(self.month, t.month()) {
        let (year, month) = if t.month() == 12 {
          (t.year() + 1, 1)
        } else {
          (t.year(), t.month() + 1)
        };
        t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
        if t.year() > year_limit {
          return None;
        }
      }

      while !(has(self.dom, t.day()) && has(self.dow, t.weekday().num_days_from_sunday())) {
        let month = t.month();
        t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
        if t.month() != month {
          continue 'search;
        }
      }

      while !has(self.hour, t.hour()) {
        let day = t.day();
        t = t.date().and_hms_opt(t.hour(), 0, 0)? + TimeDelta::hours(1);
        if t.day() != day {
          continue 'search;
        }
      }

      while !has(self.min, t.minute()) {
        let hour = t.hour();
        t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + TimeDelta::minutes(1);
        if t.hour() != hour {
          continue 'search;
        }
      }

      while !has(self.sec, t.second()) {
        let minute = t.minute();
        t += TimeDelta::seconds(1);
        if t.minute() != minute {
          continue 'search;
        }
      }

      return Some(t);
    }
  }

  /// The next matching local time after `after`. Wall-clock times skipped by a DST
  /// change are passed over.
  pub fn next_local(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
    let mut naive = after.naive_local();
    loop {
      naive = self.next(naive)?;
      if let Some(local) = Local.from_local_datetime(&naive).earliest() {
        if local > after {
          return Some(local);
        }
      }
    }
  }
}

impl FromStr for CronExpr {
  type Err = RpcError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}
