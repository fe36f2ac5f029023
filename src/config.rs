use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub signing_secret: String,
    pub jwt_secret: String,
    /// Origins allowed to call the public API from a browser. `*` allows any.
    pub cors_origins: Vec<String>,
    pub lifecycle: LifecycleConfig,
}

/// Timing knobs for signed-link renewal.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// A link is stale once it is within this margin of its expiry.
    pub refresh_buffer: chrono::Duration,
    /// Lifetime requested for every newly signed link.
    pub sign_ttl: chrono::Duration,
    /// Scheduler tick period.
    pub sweep_interval: Duration,
    /// Max records examined per scheduler tick.
    pub sweep_batch_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: chrono::Duration::minutes(5),
            sign_ttl: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(600),
            sweep_batch_size: 100,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sign_ttl <= self.refresh_buffer {
            bail!(
                "sign TTL ({}s) must exceed the refresh buffer ({}s)",
                self.sign_ttl.num_seconds(),
                self.refresh_buffer.num_seconds()
            );
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }
        if self.sweep_batch_size == 0 {
            bail!("sweep batch size must be greater than zero");
        }
        Ok(())
    }
}

// Secrets stay out of the startup log line.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_base_url", &self.public_base_url)
            .field("cors_origins", &self.cors_origins)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Portfolio resource service with self-renewing download links")]
pub struct Args {
    /// Host to bind to (overrides RESOURCE_LINKS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RESOURCE_LINKS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded objects are stored (overrides RESOURCE_LINKS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides RESOURCE_LINKS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL embedded in signed links (overrides RESOURCE_LINKS_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Comma-separated browser origins allowed by CORS (overrides RESOURCE_LINKS_CORS_ORIGINS)
    #[arg(long)]
    pub cors_origins: Option<String>,

    /// Seconds before expiry at which a link counts as stale
    #[arg(long)]
    pub refresh_buffer_secs: Option<i64>,

    /// Lifetime of each signed link in seconds
    #[arg(long)]
    pub sign_ttl_secs: Option<i64>,

    /// Seconds between scheduler sweeps
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Records examined per sweep
    #[arg(long)]
    pub sweep_batch_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn required_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => bail!("{} must be set", name),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("RESOURCE_LINKS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("RESOURCE_LINKS_PORT", 8080u16)?;
        let env_storage =
            env::var("RESOURCE_LINKS_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("RESOURCE_LINKS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/resources.db".into());
        let env_public = env::var("RESOURCE_LINKS_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into());
        let env_cors = env::var("RESOURCE_LINKS_CORS_ORIGINS").unwrap_or_else(|_| "*".into());

        let defaults = LifecycleConfig::default();
        let refresh_buffer_secs = match args.refresh_buffer_secs {
            Some(v) => v,
            None => env_or(
                "RESOURCE_LINKS_REFRESH_BUFFER_SECS",
                defaults.refresh_buffer.num_seconds(),
            )?,
        };
        let sign_ttl_secs = match args.sign_ttl_secs {
            Some(v) => v,
            None => env_or("RESOURCE_LINKS_SIGN_TTL_SECS", defaults.sign_ttl.num_seconds())?,
        };
        let sweep_interval_secs = match args.sweep_interval_secs {
            Some(v) => v,
            None => env_or(
                "RESOURCE_LINKS_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?,
        };
        let sweep_batch_size = match args.sweep_batch_size {
            Some(v) => v,
            None => env_or("RESOURCE_LINKS_SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
        };

        let lifecycle = LifecycleConfig {
            refresh_buffer: chrono::Duration::seconds(refresh_buffer_secs.max(0)),
            sign_ttl: chrono::Duration::seconds(sign_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            sweep_batch_size,
        };
        lifecycle.validate()?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args.public_base_url.unwrap_or(env_public),
            signing_secret: required_env("RESOURCE_LINKS_SIGNING_SECRET")?,
            jwt_secret: required_env("RESOURCE_LINKS_JWT_SECRET")?,
            cors_origins: parse_origins(&args.cors_origins.unwrap_or(env_cors)),
            lifecycle,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
