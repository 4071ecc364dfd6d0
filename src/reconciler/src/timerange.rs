//! Time-range filters over timestamp-bearing columns.
//!
//! A [`TimeRange`] is turned into a [`Predicate`] which can be rendered as a
//! SQL `WHERE` clause or evaluated against an in-memory [`Row`]. Ranges are
//! half-open: `column >= start AND column < end`, so adjacent segments tile a
//! parent range without gaps or double counting.

use crate::error::{ReconcileError, Result};
use crate::row::Row;
use crate::statement::validate_identifier;
use chrono::{NaiveDateTime, NaiveTime};

/// Optional bounds plus the columns they apply to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    /// A row matches when any of these columns falls in the range.
    pub timestamp_columns: Vec<String>,
    /// Truncate both bounds to dates before filtering.
    pub stick_to_dates: bool,
}

impl TimeRange {
    /// The open range: no filtering at all.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn since(start: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            ..Default::default()
        }
    }

    pub fn until(end: NaiveDateTime) -> Self {
        Self {
            end: Some(end),
            ..Default::default()
        }
    }

    /// Set the timestamp columns the bounds apply to.
    pub fn on<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.timestamp_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn dates_only(mut self) -> Self {
        self.stick_to_dates = true;
        self
    }

    /// Same columns and truncation, different bounds.
    pub fn with_bounds(&self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            timestamp_columns: self.timestamp_columns.clone(),
            stick_to_dates: self.stick_to_dates,
        }
    }

    /// Build the filter predicate for this range.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Configuration`] if both bounds truncate to
    /// the same date, if a bound is given without timestamp columns, or if a
    /// column name is not a plain identifier.
    pub fn predicate(&self) -> Result<Predicate> {
        let (start, end) = if self.stick_to_dates {
            (self.start.map(truncate_to_date), self.end.map(truncate_to_date))
        } else {
            (self.start, self.end)
        };

        if self.stick_to_dates
            && let (Some(s), Some(e)) = (start, end)
            && s == e
        {
            return Err(ReconcileError::configuration(format!(
                "date range {} to {} is empty: dates include the start and exclude the end",
                s.date(),
                e.date()
            )));
        }

        if self.timestamp_columns.is_empty() && (start.is_some() || end.is_some()) {
            return Err(ReconcileError::configuration(
                "a time range was given without any timestamp columns",
            ));
        }

        for column in &self.timestamp_columns {
            validate_identifier(column)?;
        }

        let columns = self.timestamp_columns.clone();
        let dates_only = self.stick_to_dates;
        Ok(match (start, end) {
            (Some(start), Some(end)) => Predicate::Within {
                columns,
                start,
                end,
                dates_only,
            },
            (Some(start), None) => Predicate::Since {
                columns,
                start,
                dates_only,
            },
            (None, Some(end)) => Predicate::Until {
                columns,
                end,
                dates_only,
            },
            (None, None) => Predicate::All,
        })
    }
}

pub(crate) fn truncate_to_date(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date().and_time(NaiveTime::MIN)
}

/// A row filter derived from a [`TimeRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches every row.
    All,
    /// Any column in `[start, end)`.
    Within {
        columns: Vec<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        dates_only: bool,
    },
    /// Every column `>= start`.
    Since {
        columns: Vec<String>,
        start: NaiveDateTime,
        dates_only: bool,
    },
    /// Every column `< end`.
    Until {
        columns: Vec<String>,
        end: NaiveDateTime,
        dates_only: bool,
    },
}

impl Predicate {
    pub fn is_open(&self) -> bool {
        matches!(self, Predicate::All)
    }

    /// The condition as SQL, without the `WHERE` keyword. `None` for [`Predicate::All`].
    pub fn to_sql(&self) -> Option<String> {
        self.to_sql_in(Dialect::Generic)
    }

    /// Like [`Predicate::to_sql`], spelled for a particular backend.
    pub fn to_sql_in(&self, dialect: Dialect) -> Option<String> {
        let column = |c: &String| dialect.column(c);
        match self {
            Predicate::All => None,
            Predicate::Within {
                columns,
                start,
                end,
                dates_only,
            } => {
                let start = dialect.literal(start, *dates_only);
                let end = dialect.literal(end, *dates_only);
                Some(
                    columns
                        .iter()
                        .map(column)
                        .map(|c| format!("({c} >= {start} AND {c} < {end})"))
                        .collect::<Vec<_>>()
                        .join(" OR "),
                )
            }
            Predicate::Since {
                columns,
                start,
                dates_only,
            } => {
                let start = dialect.literal(start, *dates_only);
                Some(
                    columns
                        .iter()
                        .map(column)
                        .map(|c| format!("{c} >= {start}"))
                        .collect::<Vec<_>>()
                        .join(" AND "),
                )
            }
            Predicate::Until {
                columns,
                end,
                dates_only,
            } => {
                let end = dialect.literal(end, *dates_only);
                Some(
                    columns
                        .iter()
                        .map(column)
                        .map(|c| format!("{c} < {end}"))
                        .collect::<Vec<_>>()
                        .join(" AND "),
                )
            }
        }
    }

    /// `" WHERE <condition>"`, or an empty string for the open predicate.
    pub fn where_clause(&self) -> String {
        self.where_clause_in(Dialect::Generic)
    }

    pub fn where_clause_in(&self, dialect: Dialect) -> String {
        self.to_sql_in(dialect)
            .map(|condition| format!(" WHERE {condition}"))
            .unwrap_or_default()
    }

    /// Evaluate against an in-memory row. Missing or `NULL` columns never match.
    pub fn matches(&self, row: &Row) -> bool {
        let ts = |column: &String| row.get(column).and_then(|v| v.as_timestamp());
        match self {
            Predicate::All => true,
            Predicate::Within {
                columns,
                start,
                end,
                ..
            } => columns
                .iter()
                .filter_map(ts)
                .any(|t| t >= *start && t < *end),
            Predicate::Since { columns, start, .. } => columns
                .iter()
                .all(|c| ts(c).is_some_and(|t| t >= *start)),
            Predicate::Until { columns, end, .. } => {
                columns.iter().all(|c| ts(c).is_some_and(|t| t < *end))
            }
        }
    }
}

/// How a backend spells timestamp comparisons.
///
/// SQLite has no timestamp type: a `DATE` column holding `2024-01-01` sorts
/// before the literal `'2024-01-01 00:00:00'` as text. Both sides are
/// therefore normalised with `strftime`, which keeps millisecond precision.
/// PostgreSQL coerces an untyped literal to the column type, truncating
/// `'2024-01-01 12:00:00'` to a date on `DATE` columns, so literals are typed
/// as `TIMESTAMP` there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Plain quoted literals, used for logging and in-memory endpoints.
    #[default]
    Generic,
    Postgres,
    Sqlite,
}

const SQLITE_TIMESTAMP: &str = "'%Y-%m-%d %H:%M:%f'";

impl Dialect {
    fn column(self, column: &str) -> String {
        match self {
            Dialect::Sqlite => format!("strftime({SQLITE_TIMESTAMP}, {column})"),
            Dialect::Generic | Dialect::Postgres => column.to_string(),
        }
    }

    fn literal(self, ts: &NaiveDateTime, dates_only: bool) -> String {
        let quoted = if dates_only {
            format!("'{}'", ts.format("%Y-%m-%d"))
        } else {
            format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f"))
        };
        match self {
            Dialect::Generic => quoted,
            Dialect::Postgres => format!("TIMESTAMP {quoted}"),
            Dialect::Sqlite => format!("strftime({SQLITE_TIMESTAMP}, {quoted})"),
        }
    }
}
