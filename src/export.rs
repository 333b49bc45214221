use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::is_day_key;
use crate::history::{AccountStore, ByDay, ByDayByHour, ByIdByDay, Store};
use crate::usage::{LatencyAggregate, UsageAggregate};

pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("Invalid export day range: {start_day}..{end_day}")]
    InvalidRange { start_day: String, end_day: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSelection {
    /// Empty means every stored account.
    #[serde(default)]
    pub account_ids: Vec<String>,
    pub start_day: String,
    pub end_day: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountExport {
    pub daily: ByDay<UsageAggregate>,
    pub hourly: ByDayByHour<UsageAggregate>,
    pub daily_by_model: ByIdByDay<UsageAggregate>,
    pub token_names_by_id: BTreeMap<String, String>,
    pub daily_by_token: ByIdByDay<UsageAggregate>,
    pub hourly_by_token: BTreeMap<String, ByDayByHour<UsageAggregate>>,
    pub daily_by_token_by_model: BTreeMap<String, ByIdByDay<UsageAggregate>>,
    pub latency_daily: ByDay<LatencyAggregate>,
    pub latency_daily_by_model: ByIdByDay<LatencyAggregate>,
    pub latency_daily_by_token: ByIdByDay<LatencyAggregate>,
    pub latency_daily_by_token_by_model: BTreeMap<String, ByIdByDay<LatencyAggregate>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FusedExport {
    pub daily: ByDay<UsageAggregate>,
    pub daily_by_model: ByIdByDay<UsageAggregate>,
    pub hourly: ByDayByHour<UsageAggregate>,
    pub by_model: BTreeMap<String, UsageAggregate>,
    pub token_names_by_id: BTreeMap<String, String>,
    pub daily_by_token: ByIdByDay<UsageAggregate>,
    pub hourly_by_token: BTreeMap<String, ByDayByHour<UsageAggregate>>,
    pub daily_by_token_by_model: BTreeMap<String, ByIdByDay<UsageAggregate>>,
    pub by_token: BTreeMap<String, UsageAggregate>,
    pub by_token_by_model: BTreeMap<String, BTreeMap<String, UsageAggregate>>,
    pub latency_daily: ByDay<LatencyAggregate>,
    pub latency_daily_by_token: ByIdByDay<LatencyAggregate>,
    pub latency_by_model: BTreeMap<String, LatencyAggregate>,
    pub latency_by_token: BTreeMap<String, LatencyAggregate>,
    pub latency_by_token_by_model: BTreeMap<String, BTreeMap<String, LatencyAggregate>>,
}

/// Per-account slices of the stored aggregates over an inclusive day range, plus
/// cross-account fused views.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageHistoryExport {
    pub schema_version: u32,
    pub created_at: u64,
    pub selection: ExportSelection,
    pub accounts: BTreeMap<String, AccountExport>,
    pub fused: FusedExport,
}

trait Foldable: Default {
    fn fold(&mut self, delta: &Self);
}

impl Foldable for UsageAggregate {
    fn fold(&mut self, delta: &Self) {
        self.merge(delta);
    }
}

impl Foldable for LatencyAggregate {
    fn fold(&mut self, delta: &Self) {
        self.merge(delta);
    }
}

fn fold_into<T: Foldable>(map: &mut BTreeMap<String, T>, key: &str, delta: &T) {
    map.entry(key.to_string()).or_default().fold(delta);
}

#[derive(Debug, Clone, Copy)]
struct DayRange<'a> {
    start: &'a str,
    end: &'a str,
}

impl DayRange<'_> {
    // Day keys are zero-padded, so string order is calendar order.
    fn contains(&self, day: &str) -> bool {
        day >= self.start && day <= self.end
    }

    fn pick<T: Clone>(&self, by_day: &ByDay<T>) -> ByDay<T> {
        by_day
            .iter()
            .filter(|(day, _)| self.contains(day))
            .map(|(day, v)| (day.clone(), v.clone()))
            .collect()
    }

    /// Per-id day maps; ids left without days are dropped.
    fn pick_by_id<T: Clone>(
        &self,
        by_id: &BTreeMap<String, ByDay<T>>,
    ) -> BTreeMap<String, ByDay<T>> {
        by_id
            .iter()
            .filter_map(|(id, by_day)| {
                let picked = self.pick(by_day);
                (!picked.is_empty()).then(|| (id.clone(), picked))
            })
            .collect()
    }

    fn pick_nested<T: Clone>(
        &self,
        nested: &BTreeMap<String, BTreeMap<String, ByDay<T>>>,
    ) -> BTreeMap<String, BTreeMap<String, ByDay<T>>> {
        nested
            .iter()
            .filter_map(|(id, by_id)| {
                let picked = self.pick_by_id(by_id);
                (!picked.is_empty()).then(|| (id.clone(), picked))
            })
            .collect()
    }

    fn slice(&self, store: &AccountStore) -> AccountExport {
        AccountExport {
            daily: self.pick(&store.daily),
            hourly: self.pick(&store.hourly),
            daily_by_model: self.pick_by_id(&store.daily_by_model),
            token_names_by_id: store.token_names_by_id.clone(),
            daily_by_token: self.pick_by_id(&store.daily_by_token),
            hourly_by_token: self.pick_by_id(&store.hourly_by_token),
            daily_by_token_by_model: self.pick_nested(&store.daily_by_token_by_model),
            latency_daily: self.pick(&store.latency_daily),
            latency_daily_by_model: self.pick_by_id(&store.latency_daily_by_model),
            latency_daily_by_token: self.pick_by_id(&store.latency_daily_by_token),
            latency_daily_by_token_by_model: self
                .pick_nested(&store.latency_daily_by_token_by_model),
        }
    }
}

impl FusedExport {
    fn absorb(&mut self, slice: &AccountExport) {
        for (day, agg) in &slice.daily {
            fold_into(&mut self.daily, day, agg);
        }
        for (day, hours) in &slice.hourly {
            let fused = self.hourly.entry(day.clone()).or_default();
            for (hour, agg) in hours {
                fold_into(fused, hour, agg);
            }
        }
        for (model, by_day) in &slice.daily_by_model {
            let fused = self.daily_by_model.entry(model.clone()).or_default();
            for (day, agg) in by_day {
                fold_into(fused, day, agg);
                fold_into(&mut self.by_model, model, agg);
            }
        }
        for (token_id, name) in &slice.token_names_by_id {
            if !name.is_empty() && !self.token_names_by_id.contains_key(token_id) {
                self.token_names_by_id.insert(token_id.clone(), name.clone());
            }
        }
        for (token_id, by_day) in &slice.daily_by_token {
            let fused = self.daily_by_token.entry(token_id.clone()).or_default();
            for (day, agg) in by_day {
                fold_into(fused, day, agg);
                fold_into(&mut self.by_token, token_id, agg);
            }
        }
        for (token_id, by_day) in &slice.hourly_by_token {
            let fused_token = self.hourly_by_token.entry(token_id.clone()).or_default();
            for (day, hours) in by_day {
                let fused = fused_token.entry(day.clone()).or_default();
                for (hour, agg) in hours {
                    fold_into(fused, hour, agg);
                }
            }
        }
        for (token_id, by_model) in &slice.daily_by_token_by_model {
            let fused_token = self
                .daily_by_token_by_model
                .entry(token_id.clone())
                .or_default();
            let fused_totals = self.by_token_by_model.entry(token_id.clone()).or_default();
            for (model, by_day) in by_model {
                let fused = fused_token.entry(model.clone()).or_default();
                for (day, agg) in by_day {
                    fold_into(fused, day, agg);
                    fold_into(fused_totals, model, agg);
                }
            }
        }
        for (day, agg) in &slice.latency_daily {
            fold_into(&mut self.latency_daily, day, agg);
        }
        for (model, by_day) in &slice.latency_daily_by_model {
            for agg in by_day.values() {
                fold_into(&mut self.latency_by_model, model, agg);
            }
        }
        for (token_id, by_day) in &slice.latency_daily_by_token {
            let fused = self
                .latency_daily_by_token
                .entry(token_id.clone())
                .or_default();
            for (day, agg) in by_day {
                fold_into(fused, day, agg);
                fold_into(&mut self.latency_by_token, token_id, agg);
            }
        }
        for (token_id, by_model) in &slice.latency_daily_by_token_by_model {
            let fused = self
                .latency_by_token_by_model
                .entry(token_id.clone())
                .or_default();
            for (model, by_day) in by_model {
                for agg in by_day.values() {
                    fold_into(fused, model, agg);
                }
            }
        }
    }
}

/// Build the export for `selection`. Unknown account ids stay in the echoed selection but
/// contribute nothing.
pub fn compute_export(
    store: &Store,
    selection: &ExportSelection,
    created_at_ms: u64,
) -> Result<UsageHistoryExport, ExportError> {
    let (start_day, end_day) = (selection.start_day.as_str(), selection.end_day.as_str());
    if !is_day_key(start_day) || !is_day_key(end_day) || start_day > end_day {
        return Err(ExportError::InvalidRange {
            start_day: start_day.to_string(),
            end_day: end_day.to_string(),
        });
    }
    let range = DayRange {
        start: start_day,
        end: end_day,
    };

    let account_ids = if selection.account_ids.is_empty() {
        store.accounts.keys().cloned().collect()
    } else {
        selection.account_ids.clone()
    };

    let mut accounts = BTreeMap::new();
    let mut fused = FusedExport::default();
    for id in &account_ids {
        let Some(account_store) = store.accounts.get(id) else {
            continue;
        };
        let slice = range.slice(account_store);
        fused.absorb(&slice);
        accounts.insert(id.clone(), slice);
    }

    Ok(UsageHistoryExport {
        schema_version: EXPORT_SCHEMA_VERSION,
        created_at: created_at_ms,
        selection: ExportSelection {
            account_ids,
            start_day: start_day.to_string(),
            end_day: end_day.to_string(),
        },
        accounts,
        fused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::calendar::resolve_time_zone;
    use crate::history::Cursor;
    use crate::ingest::tests::{JAN_1_10AM, consume};
    use crate::ingest::{LogItem, ingest_consume_log_items};

    const DAY: i64 = 86_400;

    fn account(items: &[LogItem]) -> AccountStore {
        let mut store = AccountStore::default();
        ingest_consume_log_items(
            &mut store,
            items,
            &Cursor::default(),
            Cursor::default(),
            resolve_time_zone(Some("UTC")),
        );
        store
    }

    fn fixture() -> Store {
        let mut store = Store::default();
        store.accounts.insert(
            "a1".into(),
            account(&[
                LogItem {
                    token_name: Some("alpha".into()),
                    quota: 10,
                    ..consume(JAN_1_10AM)
                },
                LogItem {
                    quota: 5,
                    ..consume(JAN_1_10AM + DAY)
                },
                LogItem {
                    quota: 7,
                    ..consume(JAN_1_10AM + 3 * DAY)
                },
            ]),
        );
        store.accounts.insert(
            "a2".into(),
            account(&[LogItem {
                token_name: Some("beta".into()),
                model_name: Some("claude".into()),
                quota: 20,
                use_time: Some(12.0),
                ..consume(JAN_1_10AM + 3_600)
            }]),
        );
        store
    }

    fn selection(ids: &[&str], start: &str, end: &str) -> ExportSelection {
        ExportSelection {
            account_ids: ids.iter().map(|s| s.to_string()).collect(),
            start_day: start.into(),
            end_day: end.into(),
        }
    }

    #[test]
    fn rejects_invalid_or_inverted_ranges() {
        let store = fixture();
        for (start, end) in [("2024-01-03", "2024-01-01"), ("2024-1-1", "2024-01-02"), ("", "")] {
            let err = compute_export(&store, &selection(&[], start, end), 0).expect_err("range");
            assert!(matches!(err, ExportError::InvalidRange { .. }));
        }
    }

    #[test]
    fn slices_by_range_and_fuses_across_accounts() {
        let export = compute_export(&fixture(), &selection(&[], "2024-01-01", "2024-01-02"), 42)
            .expect("export");

        assert_eq!(export.schema_version, EXPORT_SCHEMA_VERSION);
        assert_eq!(export.created_at, 42);
        assert_eq!(export.selection.account_ids, vec!["a1", "a2"]);

        let a1 = &export.accounts["a1"];
        assert_eq!(a1.daily.keys().cloned().collect::<Vec<_>>(), vec!["2024-01-01", "2024-01-02"]);
        assert!(!a1.latency_daily.contains_key("2024-01-04"));

        let fused = &export.fused;
        assert_eq!(fused.daily["2024-01-01"].requests, 2);
        assert_eq!(fused.daily["2024-01-01"].quota_consumed, 30);
        assert_eq!(fused.by_model["gpt-4"].quota_consumed, 15);
        assert_eq!(fused.by_model["claude"].quota_consumed, 20);
        assert_eq!(fused.hourly["2024-01-01"]["10"].requests, 1);
        assert_eq!(fused.hourly["2024-01-01"]["11"].requests, 1);
        // Both accounts use token id 1; the first non-empty label wins.
        assert_eq!(fused.token_names_by_id["1"], "alpha");
        assert_eq!(fused.by_token["1"].requests, 3);
        assert_eq!(fused.by_token_by_model["1"]["gpt-4"].requests, 2);
        assert_eq!(fused.latency_by_model["claude"].slow_count, 1);
        assert_eq!(fused.latency_by_token["1"].count, 3);
        assert_eq!(fused.latency_by_token_by_model["1"]["claude"].count, 1);
    }

    #[test]
    fn unknown_accounts_are_echoed_but_contribute_nothing() {
        let export = compute_export(
            &fixture(),
            &selection(&["ghost", "a2"], "2024-01-01", "2024-01-31"),
            0,
        )
        .expect("export");
        assert_eq!(export.selection.account_ids, vec!["ghost", "a2"]);
        assert_eq!(export.accounts.keys().cloned().collect::<Vec<_>>(), vec!["a2"]);
        assert_eq!(export.fused.daily["2024-01-01"].quota_consumed, 20);
    }
}
