//! Next-run computation for scheduled jobs.
//!
//! Cron expressions use the six/seven field form (seconds first) and are
//! evaluated in the job's IANA timezone, so a "9am daily" job keeps
//! firing at 9am local time across offset changes.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::errors::ScheduleError;

use super::model::{JobType, ScheduledJob};

/// Validates a job's schedule at submission time.
///
/// # Errors
///
/// Returns [`ScheduleError`] for a missing or unparseable cron
/// expression or an unknown timezone on a cron-driven job.
pub fn validate_schedule(job: &ScheduledJob) -> Result<(), ScheduleError> {
    match job.job_type {
        JobType::Cron | JobType::Recurring => {
            parse_parts(job)?;
            Ok(())
        }
        JobType::OneTime | JobType::Event => Ok(()),
    }
}

/// Computes the next self-scheduled fire time strictly after `after`.
///
/// Returns `None` when the job will not fire again on its own: event and
/// one-time jobs, an exhausted `max_executions` budget, or a next match
/// past `end_date`.
///
/// # Errors
///
/// Returns [`ScheduleError`] for an invalid cron expression or timezone.
pub fn next_run_after(
    job: &ScheduledJob,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match job.job_type {
        JobType::OneTime | JobType::Event => Ok(None),
        JobType::Cron | JobType::Recurring => {
            if let Some(max) = job.max_executions {
                if job.executions_count >= max {
                    return Ok(None);
                }
            }

            let (schedule, tz) = parse_parts(job)?;
            let from = match job.start_date {
                Some(start) if start > after => start,
                _ => after,
            };
            let next = schedule
                .after(&from.with_timezone(&tz))
                .next()
                .map(|local| local.with_timezone(&Utc));

            match next {
                Some(at) if job.end_date.is_some_and(|end| at > end) => Ok(None),
                other => Ok(other),
            }
        }
    }
}

fn parse_parts(job: &ScheduledJob) -> Result<(Schedule, Tz), ScheduleError> {
    let expression = job
        .schedule
        .as_deref()
        .ok_or_else(|| ScheduleError::new(&job.name, "missing cron expression"))?;
    let schedule = Schedule::from_str(expression).map_err(|err| {
        ScheduleError::new(
            &job.name,
            format!("invalid cron expression '{expression}': {err}"),
        )
    })?;
    let tz: Tz = job
        .timezone
        .parse()
        .map_err(|_| ScheduleError::new(&job.name, format!("unknown timezone '{}'", job.timezone)))?;
    Ok((schedule, tz))
}
