//! Scheduled provisioning and deprovisioning of the cache backend instance.
//!
//! The instance only exists during business hours on weekdays. Outside of that window the cache is simply absent and
//! [`CacheClient`](crate::CacheClient) routes everything to the record store.
use chrono::DateTime;
use chrono::Datelike;
use chrono::Days;
use chrono::Local;
use chrono::NaiveTime;
use chrono::TimeZone;
use chrono::Weekday;
use fieldx::fxstruct;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use tracing::error;
use tracing::info;
use tracing::instrument;

use crate::error::Error;
use crate::error::Result;
use crate::traits::Provisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[default]
    Basic,
    StandardHa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Provision,
    Deprovision,
}

impl Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[fxstruct(sync, no_new, builder, get)]
pub struct InstanceSpec {
    #[fieldx(builder(into))]
    name:           String,
    #[fieldx(get(copy), default(Tier::Basic))]
    tier:           Tier,
    #[fieldx(get(copy), default(1))]
    memory_size_gb: u32,
}

/// Daily window during which the instance is expected to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub provision_at:   NaiveTime,
    pub deprovision_at: NaiveTime,
    /// Monday through Friday only.
    pub weekdays_only:  bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            provision_at:   NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            deprovision_at: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN),
            weekdays_only:  true,
        }
    }
}

impl Schedule {
    pub fn at_hours(provision_hour: u32, deprovision_hour: u32) -> Result<Self> {
        let time = |hour| {
            NaiveTime::from_hms_opt(hour, 0, 0).ok_or_else(|| Error::Config(format!("{hour} is not an hour of the day")))
        };
        let schedule = Self {
            provision_at: time(provision_hour)?,
            deprovision_at: time(deprovision_hour)?,
            weekdays_only: true,
        };
        if schedule.provision_at >= schedule.deprovision_at {
            return Err(Error::Config(format!(
                "provisioning at {} must precede deprovisioning at {}",
                schedule.provision_at, schedule.deprovision_at
            )));
        }
        Ok(schedule)
    }

    fn is_active_day(&self, day: Weekday) -> bool {
        !self.weekdays_only || day.number_from_monday() <= 5
    }

    /// Whether the instance should exist at `now` according to the schedule.
    pub fn expects_instance<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let time = now.time();
        self.is_active_day(now.weekday()) && self.provision_at <= time && time < self.deprovision_at
    }

    /// The first trigger strictly after `now`.
    pub fn next_action<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<(DateTime<Tz>, LifecycleAction)> {
        let today = now.date_naive();
        let mut triggers = [
            (self.provision_at, LifecycleAction::Provision),
            (self.deprovision_at, LifecycleAction::Deprovision),
        ];
        triggers.sort_by_key(|(at, _)| *at);

        for offset in 0..=7 {
            let day = today.checked_add_days(Days::new(offset))?;
            if !self.is_active_day(day.weekday()) {
                continue;
            }
            for (time, action) in triggers {
                // Local times skipped by a DST transition don't fire that day.
                let Some(at) = now.timezone().from_local_datetime(&day.and_time(time)).earliest()
                else {
                    continue;
                };
                if at > *now {
                    return Some((at, action));
                }
            }
        }
        None
    }
}

#[derive(Debug)]
#[fxstruct(sync, no_new, default(off), builder)]
pub struct LifecycleScheduler<P>
where
    P: Provisioner,
{
    #[fieldx(get(clone), builder(required))]
    provisioner: Arc<P>,
    #[fieldx(get, builder(required))]
    instance:    InstanceSpec,
    #[fieldx(get, default(Schedule::default()))]
    schedule:    Schedule,
}

impl<P> LifecycleScheduler<P>
where
    P: Provisioner,
{
    #[instrument(level = "info", skip(self), fields(instance = %self.instance.name()))]
    pub async fn fire(&self, action: LifecycleAction) -> Result<()> {
        match action {
            LifecycleAction::Provision => {
                info!(
                    tier = ?self.instance.tier(),
                    memory_size_gb = self.instance.memory_size_gb(),
                    "creating cache instance"
                );
                self.provisioner.create_instance(&self.instance).await
            }
            LifecycleAction::Deprovision => {
                info!("deleting cache instance");
                self.provisioner.delete_instance(self.instance.name()).await
            }
        }
    }

    /// Fire triggers forever, following the local clock. A failed trigger is logged and the scheduler waits for the
    /// next one.
    pub async fn run(&self) -> Result<()> {
        loop {
            let now = Local::now();
            let Some((at, action)) = self.schedule.next_action(&now)
            else {
                return Err(Error::Config("lifecycle schedule never fires".to_string()));
            };
            info!(%at, %action, "next lifecycle trigger");
            tokio::time::sleep((at - now).to_std().unwrap_or_default()).await;

            if let Err(err) = self.fire(action).await {
                error!(%err, %action, "lifecycle trigger failed");
            }
        }
    }
}
