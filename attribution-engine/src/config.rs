use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::attribution::ModelSet;
use crate::pipeline::PipelineConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(default = "4")]
    pub partitions: usize,

    #[envconfig(default = "1024")]
    pub partition_buffer_size: usize,

    #[envconfig(default = "30m")]
    pub out_of_order_tolerance: EnvDuration,

    #[envconfig(default = "30d")]
    pub journey_window: EnvDuration,

    #[envconfig(default = "24h")]
    pub dedup_retention: EnvDuration,

    #[envconfig(default = "1h")]
    pub dedup_bucket: EnvDuration,

    #[envconfig(default = "7d")]
    pub time_decay_half_life: EnvDuration,

    #[envconfig(default = "1000000")]
    pub max_open_journeys: usize,

    #[envconfig(default = "5m")]
    pub max_future_skew: EnvDuration,

    #[envconfig(default = "500")]
    pub batch_max_size: usize,

    #[envconfig(default = "1s")]
    pub batch_max_age: EnvDuration,

    #[envconfig(default = "1000")]
    pub max_batch_events: usize,

    #[envconfig(default = "first_touch,last_touch,linear,time_decay,position_based")]
    pub requested_models: ModelSet,

    #[envconfig(default = "1m")]
    pub sweep_interval: EnvDuration,

    #[envconfig(default = "60s")]
    pub drain_timeout: EnvDuration,

    #[envconfig(default = "200ms")]
    pub sink_retry_initial: EnvDuration,

    #[envconfig(default = "30s")]
    pub sink_retry_max: EnvDuration,

    /// Unlimited when unset
    pub sink_max_attempts: Option<u32>,

    #[envconfig(default = "4")]
    pub sink_max_in_flight: usize,

    #[envconfig(default = "1h")]
    pub audit_log_retention: EnvDuration,

    #[envconfig(default = "10000")]
    pub audit_log_capacity: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            partitions: self.partitions,
            partition_buffer_size: self.partition_buffer_size,
            out_of_order_tolerance: self.out_of_order_tolerance.0,
            journey_window: self.journey_window.0,
            dedup_retention: self.dedup_retention.0,
            dedup_bucket: self.dedup_bucket.0,
            time_decay_half_life: self.time_decay_half_life.0,
            max_open_journeys: self.max_open_journeys,
            max_future_skew: self.max_future_skew.0,
            batch_max_size: self.batch_max_size,
            batch_max_age: self.batch_max_age.0,
            max_batch_events: self.max_batch_events,
            requested_models: self.requested_models.0.clone(),
            sweep_interval: self.sweep_interval.0,
            drain_timeout: self.drain_timeout.0,
            sink_retry_initial: self.sink_retry_initial.0,
            sink_retry_max: self.sink_retry_max.0,
            sink_max_attempts: self.sink_max_attempts,
            sink_max_in_flight: self.sink_max_in_flight,
            audit_log_retention: self.audit_log_retention.0,
            audit_log_capacity: self.audit_log_capacity,
        }
    }
}

/// A duration with a unit suffix (`ms`, `s`, `m`, `h`, `d`). A bare number is milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvDurationError;

impl FromStr for EnvDuration {
    type Err = ParseEnvDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (value, unit) = s.split_at(split);
        let value = value.parse::<u64>().map_err(|_| ParseEnvDurationError)?;

        let unit_ms: u64 = match unit {
            "" | "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(ParseEnvDurationError),
        };
        let ms = value.checked_mul(unit_ms).ok_or(ParseEnvDurationError)?;

        Ok(EnvDuration(time::Duration::from_millis(ms)))
    }
}
