use std::collections::BTreeMap;
use std::ops::Deref;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::controller::ControllerConfig;
use crate::error::ConfigError;
use crate::health_check::HealthCheckConfig;
use crate::types::PoolType;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "500")]
    pub redis_response_timeout_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub redis_connection_timeout_ms: EnvMsDuration,

    #[envconfig(default = "worker-lease")]
    pub lease_namespace: NonEmptyString,

    #[envconfig(default = "")]
    pub simple_instance_urls: InstanceUrls,

    #[envconfig(default = "")]
    pub hierarchical_instance_urls: InstanceUrls,

    #[envconfig(default = "30")]
    pub lease_ttl_secs: u64,

    #[envconfig(default = "10000")]
    pub heartbeat_interval_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub reconcile_interval_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub health_check_interval_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub health_check_timeout_ms: EnvMsDuration,

    #[envconfig(default = "/health")]
    pub health_check_path: String,

    #[envconfig(default = "healthy")]
    pub healthy_status: NonEmptyString,

    pub holder_id: Option<NonEmptyString>,

    pub identity_hint: Option<u16>,

    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: FlexBool,
}

/// Everything the assignment side of the service needs, validated.
#[derive(Debug, Clone)]
pub struct AssignerConfig {
    pub namespace: String,
    pub holder_id: String,
    pub identity_hint: Option<u16>,
    pub lease_ttl: time::Duration,
    pub heartbeat_interval: time::Duration,
    pub reconcile_interval: time::Duration,
    pub health_check: HealthCheckConfig,
    pub instances: BTreeMap<PoolType, Vec<String>>,
}

impl AssignerConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            holder_id: self.holder_id.clone(),
            identity_hint: self.identity_hint,
            lease_ttl: self.lease_ttl,
            heartbeat_interval: self.heartbeat_interval,
            reconcile_interval: self.reconcile_interval,
        }
    }
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn assigner_config(&self) -> Result<AssignerConfig, ConfigError> {
        let lease_ttl = time::Duration::from_secs(self.lease_ttl_secs);
        if lease_ttl < time::Duration::from_secs(1) {
            return Err(ConfigError::LeaseTtlTooShort);
        }

        for (name, interval) in [
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms),
            ("RECONCILE_INTERVAL_MS", self.reconcile_interval_ms),
            ("HEALTH_CHECK_INTERVAL_MS", self.health_check_interval_ms),
            ("HEALTH_CHECK_TIMEOUT_MS", self.health_check_timeout_ms),
        ] {
            if interval.0.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        let heartbeat_interval = self.heartbeat_interval_ms.0;
        if heartbeat_interval >= lease_ttl {
            return Err(ConfigError::HeartbeatNotShorterThanTtl {
                heartbeat_ms: heartbeat_interval.as_millis(),
                ttl_ms: lease_ttl.as_millis(),
            });
        }

        let mut instances = BTreeMap::new();
        for (pool_type, urls) in [
            (PoolType::Simple, &self.simple_instance_urls),
            (PoolType::Hierarchical, &self.hierarchical_instance_urls),
        ] {
            for url in urls.iter() {
                url::Url::parse(url).map_err(|error| ConfigError::InvalidInstanceUrl {
                    pool_type,
                    url: url.clone(),
                    error,
                })?;
            }
            instances.insert(pool_type, urls.0.clone());
        }

        let holder_id = match &self.holder_id {
            Some(holder_id) => holder_id.0.clone(),
            None => default_holder_id(),
        };

        Ok(AssignerConfig {
            namespace: self.lease_namespace.0.clone(),
            holder_id,
            identity_hint: self.identity_hint,
            lease_ttl,
            heartbeat_interval,
            reconcile_interval: self.reconcile_interval_ms.0,
            health_check: HealthCheckConfig {
                interval: self.health_check_interval_ms.0,
                timeout: self.health_check_timeout_ms.0,
                path: self.health_check_path.clone(),
                healthy_status: self.healthy_status.0.clone(),
            },
            instances,
        })
    }
}

/// `{hostname}-{pid}-{random}`: unique per process even when replicas share a host name.
fn default_holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "pool-assigner".to_string());
    format!("{}-{}-{}", host, std::process::id(), uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list of instance urls. Blank entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUrls(pub Vec<String>);

impl Deref for InstanceUrls {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for InstanceUrls {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(InstanceUrls(
            s.split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        let assigner = config.assigner_config().unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3310");
        assert!(!*config.debug);
        assert_eq!(assigner.namespace, "worker-lease");
        assert_eq!(assigner.lease_ttl, time::Duration::from_secs(30));
        assert_eq!(assigner.heartbeat_interval, time::Duration::from_secs(10));
        assert_eq!(assigner.reconcile_interval, time::Duration::from_secs(30));
        assert_eq!(assigner.health_check.path, "/health");
        assert_eq!(assigner.identity_hint, None);
        assert!(assigner.instances.values().all(Vec::is_empty));
        assert!(!assigner.holder_id.is_empty());
    }

    #[test]
    fn test_instance_urls_are_split_per_pool() {
        let config = config_from(&[
            (
                "SIMPLE_INSTANCE_URLS",
                "http://worker-a:8001, http://worker-b:8002,",
            ),
            ("HIERARCHICAL_INSTANCE_URLS", "http://worker-c:9001"),
            ("HOLDER_ID", "replica-1"),
            ("IDENTITY_HINT", "8002"),
        ]);
        let assigner = config.assigner_config().unwrap();

        assert_eq!(
            assigner.instances[&PoolType::Simple],
            vec!["http://worker-a:8001", "http://worker-b:8002"]
        );
        assert_eq!(
            assigner.instances[&PoolType::Hierarchical],
            vec!["http://worker-c:9001"]
        );
        let controller = assigner.controller_config();
        assert_eq!(controller.holder_id, "replica-1");
        assert_eq!(controller.identity_hint, Some(8002));
    }

    #[test]
    fn test_default_holder_ids_are_unique() {
        assert_ne!(default_holder_id(), default_holder_id());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_ttl() {
        let config = config_from(&[("LEASE_TTL_SECS", "10"), ("HEARTBEAT_INTERVAL_MS", "10000")]);

        assert!(matches!(
            config.assigner_config(),
            Err(ConfigError::HeartbeatNotShorterThanTtl {
                heartbeat_ms: 10000,
                ttl_ms: 10000
            })
        ));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero_ttl = config_from(&[("LEASE_TTL_SECS", "0")]);
        assert!(matches!(
            zero_ttl.assigner_config(),
            Err(ConfigError::LeaseTtlTooShort)
        ));

        let zero_reconcile = config_from(&[("RECONCILE_INTERVAL_MS", "0")]);
        assert!(matches!(
            zero_reconcile.assigner_config(),
            Err(ConfigError::ZeroInterval("RECONCILE_INTERVAL_MS"))
        ));

        let bad_url = config_from(&[("HIERARCHICAL_INSTANCE_URLS", "not a url")]);
        assert!(matches!(
            bad_url.assigner_config(),
            Err(ConfigError::InvalidInstanceUrl {
                pool_type: PoolType::Hierarchical,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_namespace_is_rejected() {
        let env = HashMap::from([("LEASE_NAMESPACE".to_string(), String::new())]);

        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_flex_bool() {
        assert!(*"yes".parse::<FlexBool>().unwrap());
        assert!(!*"0".parse::<FlexBool>().unwrap());
        assert!("maybe".parse::<FlexBool>().is_err());
    }
}
