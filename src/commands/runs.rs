use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use owo_colors::OwoColorize;

use crate::logging::{SyncRunRecord, default_journal_path};
use crate::{CliError, CliResult, RunsCommand};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RunStats {
    runs: u64,
    success: u64,
    errors: u64,
    unsupported: u64,
    partial: u64,
    ingested: u64,
    duration_ms: u64,
}

fn read_records(path: &Path) -> CliResult<Vec<SyncRunRecord>> {
    let file = File::open(path)
        .map_err(|e| CliError::Usage(format!("cannot open sync journal {:?}: {}", path, e)))?;
    Ok(BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<SyncRunRecord>(&line).ok())
        .collect())
}

fn summarize(records: &[SyncRunRecord]) -> Vec<(String, RunStats)> {
    let mut by_account: HashMap<String, RunStats> = HashMap::new();
    for r in records {
        let entry = by_account.entry(r.account_id.clone()).or_default();
        entry.runs += 1;
        match r.status.as_str() {
            "success" => entry.success += 1,
            "unsupported" => entry.unsupported += 1,
            _ => entry.errors += 1,
        }
        if r.partial {
            entry.partial += 1;
        }
        entry.ingested += r.ingested_count as u64;
        entry.duration_ms += r.duration_ms;
    }
    let mut items: Vec<_> = by_account.into_iter().collect();
    items.sort_by(|a, b| b.1.ingested.cmp(&a.1.ingested).then_with(|| a.0.cmp(&b.0)));
    items
}

pub async fn handle_runs_cmd(cmd: RunsCommand) -> CliResult<()> {
    let path = default_journal_path();
    if !path.exists() {
        println!("No sync runs recorded at {:?}", path);
        return Ok(());
    }

    match cmd {
        RunsCommand::Tail { limit, raw } => {
            if raw {
                let file = File::open(&path).map_err(|e| {
                    CliError::Usage(format!("cannot open sync journal {:?}: {}", path, e))
                })?;
                let lines: Vec<String> =
                    BufReader::new(file).lines().map_while(Result::ok).collect();
                for line in &lines[lines.len().saturating_sub(limit)..] {
                    println!("{line}");
                }
                return Ok(());
            }

            let records = read_records(&path)?;
            for r in &records[records.len().saturating_sub(limit)..] {
                println!(
                    "[{}] {} {} ({}, ingested: {}, pages: {}, items: {}{})",
                    r.timestamp_ms,
                    r.trigger,
                    r.account_id,
                    r.status,
                    r.ingested_count,
                    r.pages_fetched,
                    r.items_fetched,
                    if r.partial { ", partial" } else { "" }
                );
                if let Some(err) = &r.error {
                    println!("    error: {}", err);
                }
            }
        }
        RunsCommand::Summary { limit } => {
            let records = read_records(&path)?;
            println!("{}", format!("Sync runs by account (from {:?})", path).bold());
            println!(
                "{}",
                "account | runs | success | errors | unsupported | partial | ingested | avg_ms".bold()
            );
            for (account, s) in summarize(&records).into_iter().take(limit) {
                println!(
                    "{} | {} | {} | {} | {} | {} | {} | {}",
                    account,
                    s.runs,
                    s.success,
                    s.errors,
                    s.unsupported,
                    s.partial,
                    s.ingested,
                    s.duration_ms / s.runs.max(1)
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn record(account: &str, status: &str, ingested: usize, partial: bool) -> SyncRunRecord {
        SyncRunRecord {
            timestamp_ms: 1,
            trigger: "manual".into(),
            account_id: account.into(),
            status: status.into(),
            ingested_count: ingested,
            pages_fetched: 1,
            items_fetched: ingested,
            partial,
            error: None,
            duration_ms: 10,
        }
    }

    #[test]
    fn summary_groups_by_account_and_orders_by_ingested() {
        let items = summarize(&[
            record("a", "success", 5, false),
            record("b", "success", 50, true),
            record("a", "error", 0, false),
            record("a", "unsupported", 0, false),
        ]);
        assert_eq!(items[0].0, "b");
        assert_eq!(
            items[1],
            (
                "a".to_string(),
                RunStats {
                    runs: 3,
                    success: 1,
                    errors: 1,
                    unsupported: 1,
                    partial: 0,
                    ingested: 5,
                    duration_ms: 30,
                }
            )
        );
        assert_eq!(items[0].1.partial, 1);
    }
}
