use serde::{Deserialize, Serialize};

use super::Timing;
use crate::{
    schedule::{first_run_at, next_run_after, Frequency, Recurrence, ScheduleParams},
    utils::millis_to_datetime,
    Error, Result,
};

/// How many upcoming runs a preview lists.
const PREVIEW_RUNS: usize = 3;

/// Side-effect-free description of a schedule before it is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub text: String,
    /// Unix milliseconds of the first few runs.
    pub upcoming_runs: Vec<u64>,
}

impl Preview {
    pub fn new(params: &ScheduleParams, timing: &Timing, now: u64) -> Result<Self> {
        if timing.max_executions == Some(0) {
            return Err(Error::InvalidParameter(
                "max_executions must be at least 1".to_owned(),
            ));
        }
        if timing.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(Error::InvalidParameter(
                "Expiry must be in the future".to_owned(),
            ));
        }

        let upcoming_runs = upcoming_runs(timing, now)?;
        let mut text = format!("{} {}", action(params), cadence(&timing.recurrence));
        if let Some(max) = timing.max_executions {
            text += &format!(", {max} time{}", if max == 1 { "" } else { "s" });
        }
        if let Some(expires_at) = timing.expires_at {
            text += &format!(", until {}", format_time(expires_at));
        }
        match upcoming_runs.first() {
            Some(first) => text += &format!(". First run {}.", format_time(*first)),
            None => text += ". It would expire before its first run.",
        }

        Ok(Self {
            text,
            upcoming_runs,
        })
    }
}

fn upcoming_runs(timing: &Timing, now: u64) -> Result<Vec<u64>> {
    let limit = timing
        .max_executions
        .map_or(PREVIEW_RUNS, |max| PREVIEW_RUNS.min(max as usize));
    let mut runs = Vec::with_capacity(limit);
    let mut next = first_run_at(&timing.recurrence, now)?;
    while runs.len() < limit {
        if timing.expires_at.is_some_and(|expires_at| next >= expires_at) {
            break;
        }
        runs.push(next);
        next = next_run_after(&timing.recurrence, next, next)?;
    }
    Ok(runs)
}

fn action(params: &ScheduleParams) -> String {
    match params {
        ScheduleParams::Transfer {
            asset,
            amount,
            recipient,
        } => format!("Send {amount} {asset} to {recipient}"),
        ScheduleParams::SwapSeries {
            sell_asset,
            buy_asset,
            amount,
        } => format!("Swap {amount} {sell_asset} for {buy_asset}"),
        ScheduleParams::Rebalance {
            targets,
            threshold_pct,
        } => {
            let targets: Vec<String> = targets
                .iter()
                .map(|(symbol, pct)| format!("{pct}% {symbol}"))
                .collect();
            format!(
                "Rebalance to {} when any asset drifts {threshold_pct}% or more",
                targets.join(" / ")
            )
        }
    }
}

fn cadence(recurrence: &Recurrence) -> String {
    let every = match recurrence.frequency {
        Frequency::Hourly => "every hour",
        Frequency::Daily => "every day",
        Frequency::Weekly => "every week",
        Frequency::Monthly => "every month",
    };
    match recurrence.time_of_day {
        None => every.to_owned(),
        Some(time) => {
            let offset = recurrence.utc_offset_minutes;
            let sign = if offset < 0 { '-' } else { '+' };
            let offset = offset.unsigned_abs();
            if recurrence.frequency == Frequency::Hourly {
                format!("{every} at minute {:02}", time.minute)
            } else {
                format!(
                    "{every} at {:02}:{:02} (UTC{sign}{:02}:{:02})",
                    time.hour,
                    time.minute,
                    offset / 60,
                    offset % 60
                )
            }
        }
    }
}

fn format_time(millis: u64) -> String {
    millis_to_datetime(millis)
        .format("%Y-%m-%d %H:%M UTC")
        .to_string()
}
