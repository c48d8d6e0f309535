use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::parse_query;

pub const MAX_CRON_JOBS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron field {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("missing cron field {0}")]
    MissingField(&'static str),
    #[error("unknown cron command {0:?}")]
    UnknownCommand(String),
    #[error("cron table full ({MAX_CRON_JOBS} jobs)")]
    TableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronField {
    Any,
    Value(u8),
}

impl CronField {
    fn parse(field: &'static str, value: &str, range: (u8, u8)) -> Result<Self, CronError> {
        let value = value.trim();
        if value == "*" {
            return Ok(Self::Any);
        }
        match value.parse::<u8>() {
            Ok(number) if (range.0..=range.1).contains(&number) => Ok(Self::Value(number)),
            _ => Err(CronError::InvalidField {
                field,
                value: value.to_string(),
            }),
        }
    }

    fn matches(self, actual: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Value(expected) => u32::from(expected) == actual,
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Value(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronCommand {
    Open,
    Close,
    Off,
}

impl CronCommand {
    pub fn parse(value: &str) -> Result<Self, CronError> {
        match value.trim() {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            "off" => Ok(Self::Off),
            other => Err(CronError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// 0 = Sunday.
    pub day_of_week: CronField,
    pub command: CronCommand,
}

impl CronJob {
    /// `minute=..&hour=..&day_of_month=..&month=..&day_of_week=..&command=..`
    pub fn from_query(body: &str) -> Result<Self, CronError> {
        let pairs = parse_query(body);
        let lookup = |key: &'static str| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| *value)
                .ok_or(CronError::MissingField(key))
        };

        Ok(Self {
            minute: CronField::parse("minute", lookup("minute")?, (0, 59))?,
            hour: CronField::parse("hour", lookup("hour")?, (0, 23))?,
            day_of_month: CronField::parse("day_of_month", lookup("day_of_month")?, (1, 31))?,
            month: CronField::parse("month", lookup("month")?, (1, 12))?,
            day_of_week: CronField::parse("day_of_week", lookup("day_of_week")?, (0, 6))?,
            command: CronCommand::parse(lookup("command")?)?,
        })
    }

    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self
                .day_of_week
                .matches(at.weekday().num_days_from_sunday())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CronTable {
    jobs: Vec<CronJob>,
}

impl CronTable {
    pub fn add(&mut self, job: CronJob) -> Result<(), CronError> {
        if self.jobs.len() >= MAX_CRON_JOBS {
            return Err(CronError::TableFull);
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn add_from_query(&mut self, body: &str) -> Result<(), CronError> {
        self.add(CronJob::from_query(body)?)
    }

    /// Returns `true` if anything was removed.
    pub fn clear(&mut self) -> bool {
        let had_jobs = !self.jobs.is_empty();
        self.jobs.clear();
        had_jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[CronJob] {
        &self.jobs
    }

    pub fn truncate(&mut self) {
        self.jobs.truncate(MAX_CRON_JOBS);
    }

    /// Commands of every job matching `at`, in table order.
    pub fn due(&self, at: &NaiveDateTime) -> Vec<CronCommand> {
        self.jobs
            .iter()
            .filter(|job| job.matches(at))
            .map(|job| job.command)
            .collect()
    }
}
