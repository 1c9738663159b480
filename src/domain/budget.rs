use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, UserId};

pub type BudgetId = Uuid;

/// A calendar month in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    /// Returns None unless `month` is in 1..=12 and the year is representable.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    /// The month containing `now`.
    pub fn containing(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        // Validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open `[start, end)` bounds of the month.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (day_start(self.first_day()), day_start(self.next().first_day()))
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Midnight UTC at the start of `date`.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Monthly spending limit for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub id: BudgetId,
    pub user_id: UserId,
    pub category: String,
    pub limit_cents: Cents,
    pub period: Month,
}

impl Budget {
    pub fn new(user_id: UserId, category: String, limit_cents: Cents, period: Month) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            category,
            limit_cents,
            period,
        }
    }
}

/// Budget compared against what was actually spent in its month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget: Budget,
    pub spent: Cents,
    pub remaining: Cents,
}

impl BudgetStatus {
    pub fn new(budget: Budget, spent: Cents) -> Self {
        let remaining = budget.limit_cents - spent;
        Self {
            budget,
            spent,
            remaining,
        }
    }

    pub fn is_over_budget(&self) -> bool {
        self.remaining < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_bounds() {
        let month = Month::new(2024, 1).unwrap();
        let (start, end) = month.bounds();

        assert_eq!(start.format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2024-02-01");
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        let (start, end) = Month::new(2024, 12).unwrap().bounds();
        assert_eq!(start.format("%Y-%m-%d").to_string(), "2024-12-01");
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2025-01-01");
    }

    #[test]
    fn test_month_validation() {
        assert!(Month::new(2024, 0).is_none());
        assert!(Month::new(2024, 13).is_none());
        assert!(Month::new(2024, 2).is_some());
    }

    #[test]
    fn test_month_containing() {
        let date = DateTime::parse_from_rfc3339("2024-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Month::containing(date), Month::new(2024, 6).unwrap());
        assert_eq!(Month::containing(date).to_string(), "2024-06");
    }

    #[test]
    fn test_budget_status() {
        let budget = Budget::new(Uuid::new_v4(), "food".into(), 40000, Month::new(2024, 1).unwrap());
        let status = BudgetStatus::new(budget, 45000);
        assert_eq!(status.remaining, -5000);
        assert!(status.is_over_budget());
    }
}
