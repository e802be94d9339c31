use eyre::{eyre, Result, WrapErr};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use yield_bridge::{
    Address, Amount, DomainId, PoolConfig, ReceiverConfig, SenderConfig, BPS_DENOMINATOR,
    DEFAULT_ACCRUAL_PERIOD_SECS, DEFAULT_WITHDRAW_TIMEOUT_SECS, DEFAULT_YIELD_RATE_BPS,
};

/// Main configuration for the node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub pool: PoolConfig,
    /// Reserve the pool owner seeds on a fresh start
    pub pool_initial_liquidity: Amount,
    pub relay: RelayConfig,
    pub api: ApiConfig,
    /// Snapshot directory; state is kept in memory only when unset
    pub state_dir: Option<PathBuf>,
}

/// Relay loop configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub yield_sync_interval_ms: u64,
    /// Consecutive failures before the relay pauses
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_pause_ms: u64,
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn yield_sync_interval(&self) -> Duration {
        Duration::from_millis(self.yield_sync_interval_ms)
    }

    pub fn circuit_breaker_pause(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_pause_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Default functions
fn default_poll_interval() -> u64 {
    1000
}

fn default_yield_sync_interval() -> u64 {
    60_000
}

fn default_circuit_breaker_threshold() -> u32 {
    10
}

fn default_circuit_breaker_pause() -> u64 {
    300_000
}

fn default_api_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn required_address(name: &str) -> Result<Address> {
    let raw = required(name)?;
    Address::new(raw).wrap_err_with(|| format!("{} is not a valid address", name))
}

fn optional<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl NodeConfig {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let withdraw_timeout_secs =
            optional("WITHDRAW_TIMEOUT_SECS").unwrap_or(DEFAULT_WITHDRAW_TIMEOUT_SECS);

        let sender = SenderConfig {
            address: required_address("SENDER_ADDRESS")?,
            owner: required_address("SENDER_OWNER")?,
            domain: DomainId::Origin,
            dest_domain: DomainId::Destination,
            receiver_address: required_address("SENDER_RECEIVER_CONTRACT")?,
            withdraw_timeout_secs,
        };

        let receiver = ReceiverConfig {
            address: required_address("RECEIVER_ADDRESS")?,
            owner: required_address("RECEIVER_OWNER")?,
            domain: DomainId::Destination,
            origin_domain: DomainId::Origin,
            sender_address: required_address("RECEIVER_EXPECTED_SENDER")?,
            lending_pool: required_address("RECEIVER_LENDING_POOL")?,
        };

        let pool = PoolConfig {
            address: required_address("POOL_ADDRESS")?,
            owner: required_address("POOL_OWNER")?,
            yield_rate_bps: optional("POOL_YIELD_RATE_BPS").unwrap_or(DEFAULT_YIELD_RATE_BPS),
            accrual_period_secs: optional("POOL_ACCRUAL_PERIOD_SECS")
                .unwrap_or(DEFAULT_ACCRUAL_PERIOD_SECS),
        };

        let relay = RelayConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS").unwrap_or(default_poll_interval()),
            yield_sync_interval_ms: optional("YIELD_SYNC_INTERVAL_MS")
                .unwrap_or(default_yield_sync_interval()),
            circuit_breaker_threshold: optional("CIRCUIT_BREAKER_THRESHOLD")
                .unwrap_or(default_circuit_breaker_threshold()),
            circuit_breaker_pause_ms: optional("CIRCUIT_BREAKER_PAUSE_MS")
                .unwrap_or(default_circuit_breaker_pause()),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND").unwrap_or_else(|_| default_api_bind()),
            port: optional("API_PORT").unwrap_or(default_api_port()),
        };

        let config = NodeConfig {
            sender,
            receiver,
            pool,
            pool_initial_liquidity: optional("POOL_INITIAL_LIQUIDITY").unwrap_or(0),
            relay,
            api,
            state_dir: env::var("STATE_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if u128::from(self.pool.yield_rate_bps) > BPS_DENOMINATOR {
            return Err(eyre!(
                "pool.yield_rate_bps cannot exceed {}",
                BPS_DENOMINATOR
            ));
        }

        if self.pool.accrual_period_secs == 0 {
            return Err(eyre!("pool.accrual_period_secs must be greater than 0"));
        }

        if self.sender.withdraw_timeout_secs == 0 {
            return Err(eyre!("sender.withdraw_timeout_secs must be greater than 0"));
        }

        if self.relay.poll_interval_ms == 0 {
            return Err(eyre!("relay.poll_interval_ms must be greater than 0"));
        }

        if self.relay.yield_sync_interval_ms == 0 {
            return Err(eyre!("relay.yield_sync_interval_ms must be greater than 0"));
        }

        if self.sender.address == self.receiver.address {
            return Err(eyre!("sender and receiver cannot share an address"));
        }

        Ok(())
    }

    /// Check that sender, receiver and pool reference each other
    ///
    /// A failure here leaves the receiver halted until the addresses are fixed.
    pub fn verify_deployment(&self) -> Result<()> {
        if self.sender.receiver_address != self.receiver.address {
            return Err(eyre!(
                "sender points at receiver {}, but the receiver is deployed at {}",
                self.sender.receiver_address,
                self.receiver.address
            ));
        }

        if self.receiver.sender_address != self.sender.address {
            return Err(eyre!(
                "receiver expects sender {}, but the sender is deployed at {}",
                self.receiver.sender_address,
                self.sender.address
            ));
        }

        if self.receiver.lending_pool != self.pool.address {
            return Err(eyre!(
                "receiver lending pool {} does not match pool {}",
                self.receiver.lending_pool,
                self.pool.address
            ));
        }

        Ok(())
    }
}
