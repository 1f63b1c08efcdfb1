use chrono::{Datelike, Days, NaiveDate};
use rust_decimal::Decimal;

pub const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Signed number of days from `start` to `end`.
pub fn days_between(end: NaiveDate, start: NaiveDate) -> i64 {
    (end - start).num_days()
}

/// `part / whole * 100`, or `None` when `whole` is not a positive amount.
pub fn percent_of(part: Decimal, whole: Decimal) -> Option<Decimal> {
    if whole <= Decimal::ZERO {
        return None;
    }
    part.checked_mul(HUNDRED)?.checked_div(whole)
}

/// Sum of `values`, or `None` if it leaves the `Decimal` range.
pub fn checked_sum<I>(values: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
}

pub fn first_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

pub fn same_calendar_month(date: NaiveDate, year: i32, month: u32) -> bool {
    date.year() == year && date.month() == month
}
