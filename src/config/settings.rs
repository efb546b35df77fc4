use std::time::Duration;

use serde::Deserialize;

use crate::client::{QueuePolicy, RetryPolicy};
use crate::transport::Endpoint;

/// Top-level configuration settings for the client and the publisher binary.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub publisher: PublisherSettings,
    pub log: LogSettings,
}

/// Where the broker lives and how to log in.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long closing waits for the background task; `<= 0` waits forever.
    pub stop_wait_timeout_ms: i64,
}

impl BrokerSettings {
    pub fn stop_wait_timeout(&self) -> Option<Duration> {
        u64::try_from(self.stop_wait_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Credentials are only attached when a username is configured.
    pub fn endpoint(&self) -> Endpoint {
        let endpoint = Endpoint::new(self.host.clone(), self.port);
        match &self.username {
            Some(username) => {
                endpoint.with_credentials(username.clone(), self.password.clone().unwrap_or_default())
            }
            None => endpoint,
        }
    }
}

/// Reconnect backoff. `max_retries < 0` means retry forever.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    pub init_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,
    pub max_retries: i64,
    pub reset_threshold_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            init_delay: Duration::from_millis(self.init_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: self.backoff_factor,
            jitter: self.jitter,
            max_retries: u32::try_from(self.max_retries).ok(),
            reset_threshold: Duration::from_millis(self.reset_threshold_ms),
        }
    }
}

/// Bounds on the offline publish queue.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub max_entries: usize,
    pub max_age_ms: u64,
}

impl QueueSettings {
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_entries: self.max_entries,
            max_age: Duration::from_millis(self.max_age_ms),
        }
    }
}

/// Knobs of the metric publisher binary.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub topic: String,
    pub send_delay_secs: u64,
    pub value_min: i64,
    pub value_max: i64,
}

impl PublisherSettings {
    pub fn destination(&self) -> String {
        format!("/topic/{}", self.topic)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub queue: Option<PartialQueueSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stop_wait_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub init_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<f64>,
    pub max_retries: Option<i64>,
    pub reset_threshold_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub max_entries: Option<usize>,
    pub max_age_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPublisherSettings {
    pub topic: Option<String>,
    pub send_delay_secs: Option<u64>,
    pub value_min: Option<i64>,
    pub value_max: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let queue = self.queue.unwrap_or_default();
        let publisher = self.publisher.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                host: broker.host.unwrap_or(default.broker.host),
                port: broker.port.unwrap_or(default.broker.port),
                username: broker.username.or(default.broker.username),
                password: broker.password.or(default.broker.password),
                stop_wait_timeout_ms: broker
                    .stop_wait_timeout_ms
                    .unwrap_or(default.broker.stop_wait_timeout_ms),
            },
            retry: RetrySettings {
                init_delay_ms: retry.init_delay_ms.unwrap_or(default.retry.init_delay_ms),
                max_delay_ms: retry.max_delay_ms.unwrap_or(default.retry.max_delay_ms),
                backoff_factor: retry.backoff_factor.unwrap_or(default.retry.backoff_factor),
                jitter: retry.jitter.unwrap_or(default.retry.jitter),
                max_retries: retry.max_retries.unwrap_or(default.retry.max_retries),
                reset_threshold_ms: retry
                    .reset_threshold_ms
                    .unwrap_or(default.retry.reset_threshold_ms),
            },
            queue: QueueSettings {
                max_entries: queue.max_entries.unwrap_or(default.queue.max_entries),
                max_age_ms: queue.max_age_ms.unwrap_or(default.queue.max_age_ms),
            },
            publisher: PublisherSettings {
                topic: publisher.topic.unwrap_or(default.publisher.topic),
                send_delay_secs: publisher
                    .send_delay_secs
                    .unwrap_or(default.publisher.send_delay_secs),
                value_min: publisher.value_min.unwrap_or(default.publisher.value_min),
                value_max: publisher.value_max.unwrap_or(default.publisher.value_max),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                username: None,
                password: None,
                stop_wait_timeout_ms: 5000,
            },
            retry: RetrySettings {
                init_delay_ms: 100,
                max_delay_ms: 60_000,
                backoff_factor: 2.0,
                jitter: 0.2,
                max_retries: -1,
                reset_threshold_ms: 300_000,
            },
            queue: QueueSettings {
                max_entries: 1000,
                max_age_ms: 300_000,
            },
            publisher: PublisherSettings {
                topic: "simple".to_string(),
                send_delay_secs: 10,
                value_min: 0,
                value_max: 100,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
