//! Source/target reconciliation.
//!
//! A [`ReconciliationPair`] compares a table between a source store and the
//! target store an ELT pipeline loads from it, and deletes target rows whose
//! keys no longer exist in the source ("orphans").
//!
//! ## Binary search
//!
//! Diffing full key sets is expensive on large tables. The binary-search
//! removal bisects the time range, using cheap target-side counts to decide
//! per segment whether to:
//!
//! 1. diff the whole segment directly (segment too narrow to split),
//! 2. skip it (both halves empty),
//! 3. diff each half directly (both halves below the threshold), or
//! 4. bisect both halves further.
//!
//! Segments are half-open, so the per-segment removals add up to what a
//! single flat removal over the whole range would remove.

use crate::endpoint::DataEndpoint;
use crate::error::{QueryError, ReconcileError, Result};
use crate::key::{KeyValue, OrphanSet};
use crate::row::Value;
use crate::sql::SqlEndpoint;
use crate::statement::{Aggregate, KEY_ALIAS, Statement, validate_identifier};
use crate::timerange::{Predicate, TimeRange, truncate_to_date};
use chrono::{NaiveDateTime, TimeDelta};
use common::config::{Configuration, ReconcileConfig};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Tuning for [`ReconciliationPair::remove_orphans_from_target_with_binary_search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BisectOptions {
    /// A half with fewer target rows than this is diffed directly.
    pub threshold: u64,
    /// Segments whose halves would be narrower than this are diffed without splitting.
    pub min_segment_size: Duration,
}

impl Default for BisectOptions {
    fn default() -> Self {
        Self {
            threshold: 10_000,
            min_segment_size: Duration::from_secs(10),
        }
    }
}

impl From<&ReconcileConfig> for BisectOptions {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_segment_size: config.min_segment_size,
        }
    }
}

/// A `[start, end)` slice of the range being bisected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

enum Task {
    Bisect(Segment),
    Diff(Segment),
}

/// What to do with a segment after looking at its half counts.
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    DiffWhole,
    Skip,
    DiffHalves(Segment, Segment),
    Split(Segment, Segment),
}

/// Split point of `[start, end)`. Under date truncation only whole days count.
fn midpoint(start: NaiveDateTime, end: NaiveDateTime, dates_only: bool) -> NaiveDateTime {
    if dates_only {
        start + TimeDelta::days((end - start).num_days() / 2)
    } else {
        start + (end - start) / 2
    }
}

/// A source and a target endpoint reconciled under one name.
pub struct ReconciliationPair {
    name: String,
    source: Arc<dyn DataEndpoint>,
    target: Arc<dyn DataEndpoint>,
}

impl fmt::Debug for ReconciliationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationPair")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ReconciliationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl ReconciliationPair {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DataEndpoint>,
        target: Arc<dyn DataEndpoint>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            target,
        }
    }

    /// Connect the pair registered under `name`.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::Configuration`] if the pair or one of its databases
    /// is not configured, [`ReconcileError::Query`] if a connection fails.
    pub async fn from_config(name: &str, config: &Configuration) -> Result<Self> {
        let pair = config.pair(name).ok_or_else(|| {
            ReconcileError::configuration(format!("no pair configured under `{name}`"))
        })?;
        let source = SqlEndpoint::from_settings(&pair.source, config).await?;
        let target = SqlEndpoint::from_settings(&pair.target, config).await?;
        tracing::info!(
            pair = %name,
            source = %pair.source,
            target = %pair.target,
            "Reconciliation pair connected"
        );
        Ok(Self::new(name, Arc::new(source), Arc::new(target)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target count minus source count over `range`.
    ///
    /// Zero means no detectable difference in the window, not identical rows:
    /// duplicates and replacements can cancel out.
    pub async fn compare_counts(
        &self,
        table: &str,
        key_column: Option<&str>,
        range: &TimeRange,
    ) -> Result<i64> {
        validate_identifier(table)?;
        if let Some(key_column) = key_column {
            validate_identifier(key_column)?;
        }
        let predicate = range.predicate()?;
        self.count_delta(table, key_column, &predicate).await
    }

    async fn count_delta(
        &self,
        table: &str,
        key_column: Option<&str>,
        predicate: &Predicate,
    ) -> Result<i64> {
        let target = self.target.count(table, key_column, predicate).await?;
        let source = self.source.count(table, key_column, predicate).await?;
        let delta = target as i64 - source as i64;
        tracing::debug!(
            pair = %self.name,
            table = %table,
            target,
            source,
            delta,
            "Compared counts"
        );
        Ok(delta)
    }

    /// Keys present in the target but missing from the source within `range`.
    ///
    /// With a bounded range the counts are compared first and an equal count
    /// is taken to mean there are no orphans in the window. Orphans only ever
    /// make the target larger, so this holds as long as a deletion in the
    /// source is not offset by a row the target has not received yet.
    pub async fn find_orphans(
        &self,
        table: &str,
        key_column: &str,
        range: &TimeRange,
    ) -> Result<OrphanSet> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        let predicate = range.predicate()?;

        if !predicate.is_open() {
            let delta = self.count_delta(table, None, &predicate).await?;
            if delta == 0 {
                tracing::debug!(
                    pair = %self.name,
                    table = %table,
                    "Counts match in range, skipping key comparison"
                );
                return Ok(OrphanSet::new());
            }
        }

        let statement = Statement::SelectKeys {
            table: table.to_string(),
            key_column: key_column.to_string(),
            predicate,
        };
        tracing::debug!(sql = %statement.to_sql(), "Key lookup for orphans");

        let target_keys = fetch_keys(self.target.as_ref(), &statement).await?;
        let source_keys = fetch_keys(self.source.as_ref(), &statement).await?;

        let orphans: OrphanSet = target_keys.difference(&source_keys).cloned().collect();
        tracing::debug!(
            pair = %self.name,
            table = %table,
            target_keys = target_keys.len(),
            source_keys = source_keys.len(),
            orphans = orphans.len(),
            "Compared keys"
        );
        Ok(orphans)
    }

    /// Delete every orphan in `range` from the target with a single statement.
    ///
    /// Returns the number of orphans removed. No statement is issued when
    /// there are none.
    pub async fn remove_orphans_from_target(
        &self,
        table: &str,
        key_column: &str,
        range: &TimeRange,
    ) -> Result<u64> {
        let orphans = self.find_orphans(table, key_column, range).await?;
        if orphans.is_empty() {
            tracing::info!(pair = %self.name, table = %table, "No orphans found");
            return Ok(0);
        }

        let removed = orphans.len() as u64;
        tracing::info!(
            pair = %self.name,
            table = %table,
            orphans = removed,
            "Found orphaned records in target"
        );

        let statement = Statement::DeleteKeys {
            table: table.to_string(),
            key_column: key_column.to_string(),
            keys: orphans.into_iter().collect(),
        };
        tracing::info!(sql = %statement.to_sql(), "Deleting orphans");
        self.target.execute(&statement).await?;

        Ok(removed)
    }

    /// Remove orphans by bisecting `range` until segments are cheap to diff.
    ///
    /// Unset bounds are taken from the target: the earliest and latest value
    /// over all timestamp columns (the latest widened by one millisecond, or
    /// one day under date truncation, so it falls inside the half-open range).
    /// A target without any timestamps has nothing to remove.
    ///
    /// Returns the total number of rows removed. The first failing query
    /// aborts the whole run; what completed up to that point is logged.
    pub async fn remove_orphans_from_target_with_binary_search(
        &self,
        table: &str,
        key_column: &str,
        range: &TimeRange,
        options: &BisectOptions,
    ) -> Result<u64> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        if range.timestamp_columns.is_empty() {
            return Err(ReconcileError::configuration(
                "binary search needs at least one timestamp column",
            ));
        }
        range.predicate()?;
        let min_segment_size = TimeDelta::from_std(options.min_segment_size).map_err(|e| {
            ReconcileError::configuration(format!("invalid minimum segment size: {e}"))
        })?;

        let Some((start, end)) = self.resolve_bounds(table, range).await? else {
            tracing::info!(
                pair = %self.name,
                table = %table,
                "Target has no timestamps, nothing to remove"
            );
            return Ok(0);
        };
        if start >= end {
            tracing::info!(
                pair = %self.name,
                table = %table,
                %start,
                %end,
                "Empty range, nothing to remove"
            );
            return Ok(0);
        }

        tracing::info!(
            pair = %self.name,
            table = %table,
            %start,
            %end,
            threshold = options.threshold,
            "Starting binary search orphan removal"
        );

        let mut pending = vec![Task::Bisect(Segment { start, end })];
        let mut removed = 0u64;
        let mut completed = 0usize;

        while let Some(task) = pending.pop() {
            let step = match task {
                Task::Diff(segment) => self
                    .remove_orphans_from_target(
                        table,
                        key_column,
                        &range.with_bounds(segment.start, segment.end),
                    )
                    .await
                    .map(|n| {
                        removed += n;
                        completed += 1;
                    }),
                Task::Bisect(segment) => self
                    .plan_segment(
                        table,
                        key_column,
                        range,
                        segment,
                        options.threshold,
                        min_segment_size,
                    )
                    .await
                    .map(|plan| match plan {
                        Plan::DiffWhole => pending.push(Task::Diff(segment)),
                        Plan::Skip => completed += 1,
                        Plan::DiffHalves(left, right) => {
                            pending.push(Task::Diff(right));
                            pending.push(Task::Diff(left));
                        }
                        Plan::Split(left, right) => {
                            pending.push(Task::Bisect(right));
                            pending.push(Task::Bisect(left));
                        }
                    }),
            };

            if let Err(e) = step {
                tracing::error!(
                    pair = %self.name,
                    table = %table,
                    error = %e,
                    removed,
                    completed_segments = completed,
                    pending_segments = pending.len(),
                    "Binary search orphan removal aborted"
                );
                return Err(e);
            }

            tracing::debug!(
                removed,
                completed_segments = completed,
                pending_segments = pending.len(),
                "Binary search progress"
            );
        }

        tracing::info!(
            pair = %self.name,
            table = %table,
            removed,
            segments = completed,
            "Binary search orphan removal complete"
        );
        Ok(removed)
    }

    async fn plan_segment(
        &self,
        table: &str,
        key_column: &str,
        range: &TimeRange,
        segment: Segment,
        threshold: u64,
        min_segment_size: TimeDelta,
    ) -> Result<Plan> {
        let Segment { start, end } = segment;
        let mid = midpoint(start, end, range.stick_to_dates);
        tracing::debug!(%start, %mid, %end, "Bisecting segment");

        if mid == start || mid == end || mid - start < min_segment_size {
            return Ok(Plan::DiffWhole);
        }

        let count1 = self
            .target
            .count(table, Some(key_column), &range.with_bounds(start, mid).predicate()?)
            .await?;
        let count2 = self
            .target
            .count(table, Some(key_column), &range.with_bounds(mid, end).predicate()?)
            .await?;
        tracing::debug!(count1, count2, "Segment half counts");

        let left = Segment { start, end: mid };
        let right = Segment { start: mid, end };
        if count1 == 0 && count2 == 0 {
            Ok(Plan::Skip)
        } else if count1 < threshold && count2 < threshold {
            Ok(Plan::DiffHalves(left, right))
        } else if count1 >= threshold || count2 >= threshold {
            Ok(Plan::Split(left, right))
        } else {
            Err(ReconcileError::Logic(format!(
                "unhandled segment state: count1={count1} count2={count2} threshold={threshold}"
            )))
        }
    }

    /// Explicit bounds, or the target's earliest/latest timestamps for unset ones.
    async fn resolve_bounds(
        &self,
        table: &str,
        range: &TimeRange,
    ) -> Result<Option<(NaiveDateTime, NaiveDateTime)>> {
        let start = match range.start {
            Some(start) => start,
            None => match self.target_timestamp(table, range, Aggregate::Min).await? {
                Some(start) => start,
                None => return Ok(None),
            },
        };
        let end = match range.end {
            Some(end) => end,
            None => match self.target_timestamp(table, range, Aggregate::Max).await? {
                Some(latest) if range.stick_to_dates => {
                    truncate_to_date(latest) + TimeDelta::days(1)
                }
                Some(latest) => latest + TimeDelta::milliseconds(1),
                None => return Ok(None),
            },
        };

        if range.stick_to_dates {
            Ok(Some((truncate_to_date(start), truncate_to_date(end))))
        } else {
            Ok(Some((start, end)))
        }
    }

    async fn target_timestamp(
        &self,
        table: &str,
        range: &TimeRange,
        aggregate: Aggregate,
    ) -> Result<Option<NaiveDateTime>> {
        let rows = self
            .target
            .execute(&Statement::TimestampBounds {
                table: table.to_string(),
                columns: range.timestamp_columns.clone(),
                aggregate,
            })
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(range.timestamp_columns.len());
        for column in &range.timestamp_columns {
            match row.get(column) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    let ts = value.as_timestamp().ok_or_else(|| QueryError::Decode {
                        column: column.clone(),
                        reason: format!("`{value}` is not a timestamp"),
                    })?;
                    values.push(ts);
                }
            }
        }

        Ok(match aggregate {
            Aggregate::Min => values.into_iter().min(),
            Aggregate::Max => values.into_iter().max(),
        })
    }
}

async fn fetch_keys(
    endpoint: &dyn DataEndpoint,
    statement: &Statement,
) -> Result<BTreeSet<KeyValue>, QueryError> {
    let rows = endpoint.execute(statement).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get(KEY_ALIAS))
        .filter_map(KeyValue::from_value)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_midpoint() {
        assert_eq!(
            midpoint(ts("2024-01-01 00:00:00"), ts("2024-01-02 00:00:00"), false),
            ts("2024-01-01 12:00:00")
        );
        // an odd number of days rounds down to a whole day
        assert_eq!(
            midpoint(ts("2024-01-01 00:00:00"), ts("2024-01-04 00:00:00"), true),
            ts("2024-01-02 00:00:00")
        );
    }

    #[test]
    fn test_midpoint_of_indivisible_segment_is_start() {
        let start = ts("2024-01-01 00:00:00");
        assert_eq!(midpoint(start, start + TimeDelta::days(1), true), start);
        assert_eq!(midpoint(start, start + TimeDelta::nanoseconds(1), false), start);
    }

    #[test]
    fn test_midpoint_strictly_shrinks() {
        let mut start = ts("2024-01-01 00:00:00");
        let end = ts("2024-03-01 00:00:00");
        let mut steps = 0;
        loop {
            let mid = midpoint(start, end, false);
            if mid == start {
                break;
            }
            assert!(mid > start && mid < end);
            start = mid;
            steps += 1;
        }
        assert!(steps > 10);
    }

    #[test]
    fn test_bisect_options_from_config() {
        let config = ReconcileConfig {
            threshold: 7,
            min_segment_size: Duration::from_secs(60),
        };
        let options = BisectOptions::from(&config);
        assert_eq!(options.threshold, 7);
        assert_eq!(options.min_segment_size, Duration::from_secs(60));
        assert_eq!(BisectOptions::default().threshold, 10_000);
    }
}
