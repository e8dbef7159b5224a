use chrono_tz::Tz;
use std::{collections::HashMap, env, net::SocketAddr, str::FromStr, time::Duration};
use thiserror::Error;
use url::Url;

const MIN_SECRET_LENGTH: usize = 32;
const MAX_LOOKAHEAD_MONTHS: u32 = 24;
const DEFAULT_SUBJECTS: &str = "audit.events,consent.granted,consent.revoked";

/// Every configuration problem found during startup validation.
#[derive(Debug, Error)]
#[error("invalid configuration:\n  - {}", .problems.join("\n  - "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitBackendKind {
    Kms,
    Local,
}

impl FromStr for TransitBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "kms" => Ok(Self::Kms),
            "local" => Ok(Self::Local),
            other => Err(format!("TRANSIT_BACKEND must be kms or local, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub database_acquire_timeout_seconds: u64,
    pub http_bind_addr: SocketAddr,
    pub nats_url: String,
    pub nats_stream: String,
    pub ledger_name: String,
    pub ingestion_subjects: Vec<String>,
    pub ingestion_retry_delay_seconds: u64,
    pub ingestion_ack_wait_seconds: u64,
    pub transit_backend: TransitBackendKind,
    pub aws_region: String,
    pub kms_key_id: String,
    pub local_transit_key: String,
    pub envelope_integrity_key: String,
    pub encryptor_timeout_ms: u64,
    pub partition_tick_seconds: u64,
    pub partition_lookahead_months: u32,
    pub time_zone: Tz,
    pub query_decrypt_concurrency: usize,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Parses and validates configuration, collecting every problem instead of
    /// stopping at the first one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = EnvReader {
            lookup,
            problems: Vec::new(),
        };

        let database_url = reader.required("DATABASE_URL");
        let database_max_connections = reader.parsed("DATABASE_MAX_CONNECTIONS", 10u32);
        let database_acquire_timeout_seconds =
            reader.parsed("DATABASE_ACQUIRE_TIMEOUT_SECONDS", 30u64);
        let http_bind_addr = reader.parsed(
            "HTTP_BIND_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 3000)),
        );

        let nats_url = reader.required("NATS_URL");
        if !nats_url.is_empty() && Url::parse(&nats_url).is_err() {
            reader.problem(format!("NATS_URL is not a valid URL: {}", nats_url));
        }
        let nats_stream = reader.optional("NATS_STREAM", "AUDIT");
        let ledger_name = reader.optional("LEDGER_NAME", "compliance-ledger");
        let ingestion_subjects: Vec<String> = reader
            .optional("INGESTION_SUBJECTS", DEFAULT_SUBJECTS)
            .split(',')
            .map(|subject| subject.trim().to_string())
            .filter(|subject| !subject.is_empty())
            .collect();
        if ingestion_subjects.is_empty() {
            reader.problem("INGESTION_SUBJECTS must list at least one subject".to_string());
        }
        let ingestion_retry_delay_seconds = reader.parsed("INGESTION_RETRY_DELAY_SECONDS", 5u64);
        let ingestion_ack_wait_seconds = reader.parsed("INGESTION_ACK_WAIT_SECONDS", 30u64);

        let transit_backend = match reader.optional("TRANSIT_BACKEND", "kms").parse() {
            Ok(kind) => kind,
            Err(problem) => {
                reader.problem(problem);
                TransitBackendKind::Kms
            }
        };
        let aws_region = reader.optional("AWS_REGION", "ap-northeast-1");
        let kms_key_id = reader.optional("KMS_KEY_ID", "");
        let local_transit_key = reader.optional("LOCAL_TRANSIT_KEY", "");
        match transit_backend {
            TransitBackendKind::Kms if kms_key_id.is_empty() => {
                reader.problem("KMS_KEY_ID is required when TRANSIT_BACKEND=kms".to_string());
            }
            TransitBackendKind::Local if local_transit_key.len() < MIN_SECRET_LENGTH => {
                reader.problem(format!(
                    "LOCAL_TRANSIT_KEY must be at least {} characters when TRANSIT_BACKEND=local",
                    MIN_SECRET_LENGTH
                ));
            }
            _ => {}
        }
        let envelope_integrity_key = reader.required("ENVELOPE_INTEGRITY_KEY");
        if !envelope_integrity_key.is_empty() && envelope_integrity_key.len() < MIN_SECRET_LENGTH
        {
            reader.problem(format!(
                "ENVELOPE_INTEGRITY_KEY must be at least {} characters",
                MIN_SECRET_LENGTH
            ));
        }
        let encryptor_timeout_ms = reader.parsed("ENCRYPTOR_TIMEOUT_MS", 5_000u64);

        let partition_tick_seconds = reader.parsed("PARTITION_TICK_SECONDS", 3_600u64);
        if partition_tick_seconds == 0 {
            reader.problem("PARTITION_TICK_SECONDS must be greater than zero".to_string());
        }
        let partition_lookahead_months = reader.parsed("PARTITION_LOOKAHEAD_MONTHS", 3u32);
        if !(1..=MAX_LOOKAHEAD_MONTHS).contains(&partition_lookahead_months) {
            reader.problem(format!(
                "PARTITION_LOOKAHEAD_MONTHS must be between 1 and {}",
                MAX_LOOKAHEAD_MONTHS
            ));
        }
        let time_zone_name = reader.optional("APP_TIMEZONE", "UTC");
        let time_zone: Tz = match time_zone_name.parse() {
            Ok(tz) => tz,
            Err(_) => {
                reader.problem(format!("Invalid APP_TIMEZONE value: {}", time_zone_name));
                chrono_tz::UTC
            }
        };
        let query_decrypt_concurrency = reader.parsed("QUERY_DECRYPT_CONCURRENCY", 8usize);
        if query_decrypt_concurrency == 0 {
            reader.problem("QUERY_DECRYPT_CONCURRENCY must be greater than zero".to_string());
        }

        if !reader.problems.is_empty() {
            return Err(ConfigError {
                problems: reader.problems,
            });
        }

        Ok(Config {
            database_url,
            database_max_connections,
            database_acquire_timeout_seconds,
            http_bind_addr,
            nats_url,
            nats_stream,
            ledger_name,
            ingestion_subjects,
            ingestion_retry_delay_seconds,
            ingestion_ack_wait_seconds,
            transit_backend,
            aws_region,
            kms_key_id,
            local_transit_key,
            envelope_integrity_key,
            encryptor_timeout_ms,
            partition_tick_seconds,
            partition_lookahead_months,
            time_zone,
            query_decrypt_concurrency,
        })
    }

    pub fn encryptor_timeout(&self) -> Duration {
        Duration::from_millis(self.encryptor_timeout_ms)
    }

    pub fn partition_tick(&self) -> Duration {
        Duration::from_secs(self.partition_tick_seconds)
    }

    pub fn ingestion_retry_delay(&self) -> Duration {
        Duration::from_secs(self.ingestion_retry_delay_seconds)
    }

    /// Durable consumer name for a subject: one consumer group per ledger.
    pub fn consumer_name(&self, subject: &str) -> String {
        durable_consumer_name(&self.ledger_name, subject)
    }
}

pub fn durable_consumer_name(ledger_name: &str, subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{}-{}", ledger_name, sanitized)
}

struct EnvReader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn value(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&mut self, key: &str) -> String {
        match self.value(key) {
            Some(value) => value,
            None => {
                self.problem(format!("{} is required", key));
                String::new()
            }
        }
    }

    fn optional(&self, key: &str, default: &str) -> String {
        self.value(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&mut self, key: &str, default: T) -> T {
        match self.value(key) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    self.problem(format!("{} has an invalid value: {}", key, raw));
                    default
                }
            },
            None => default,
        }
    }

    fn problem(&mut self, message: String) {
        self.problems.push(message);
    }
}
