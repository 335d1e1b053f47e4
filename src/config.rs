use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::models::object::{CropQuadrant, Orientation};
use crate::services::{transform_cache::TransformSettings, upload::UploadSettings};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub cache_dir: String,
    pub database_url: String,
    pub base_url: String,
    pub private_key: String,
    pub admin_token: Option<String>,
    pub max_age_secs: u64,
    pub allowed_dimensions: Vec<(u32, u32)>,
    pub allow_dangerous_transforms: bool,
    pub crop_quadrant_portrait: CropQuadrant,
    pub crop_quadrant_landscape: CropQuadrant,
    pub crop_quadrant_square: CropQuadrant,
    pub max_retina: u32,
    pub transform_workers: usize,
    pub transform_queue_timeout_ms: u64,
    pub max_upload_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object CDN with on-demand image renditions")]
pub struct Args {
    /// Host to bind to (overrides CDN_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CDN_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where the local driver stores objects (overrides CDN_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory holding rendered renditions (overrides CDN_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Database URL (overrides CDN_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL used when generating links (overrides CDN_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Permitted transform sizes, e.g. "100x100,200x150" (overrides CDN_ALLOWED_DIMENSIONS)
    #[arg(long)]
    pub allowed_dimensions: Option<String>,

    /// Allow any transform size (overrides CDN_ALLOW_DANGEROUS_TRANSFORMS)
    #[arg(long)]
    pub allow_dangerous_transforms: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_DIMENSIONS: &str = "50x50,100x100,150x150,200x200,300x300,400x300,800x600";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            cache_dir: "./data/cache".into(),
            database_url: "sqlite://./data/meta/object_cdn.db".into(),
            base_url: String::new(),
            private_key: "change-me".into(),
            admin_token: None,
            max_age_secs: 2_592_000,
            // The literal list always parses.
            allowed_dimensions: parse_dimensions(DEFAULT_DIMENSIONS).unwrap_or_default(),
            allow_dangerous_transforms: false,
            crop_quadrant_portrait: CropQuadrant::Center,
            crop_quadrant_landscape: CropQuadrant::Center,
            crop_quadrant_square: CropQuadrant::Center,
            max_retina: 3,
            transform_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            transform_queue_timeout_ms: 10_000,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let defaults = Self::default();

        let env_host = env::var("CDN_HOST").unwrap_or(defaults.host);
        let env_port = env_parse("CDN_PORT", defaults.port)?;
        let env_storage = env::var("CDN_STORAGE_DIR").unwrap_or(defaults.storage_dir);
        let env_cache = env::var("CDN_CACHE_DIR").unwrap_or(defaults.cache_dir);
        let env_db = env::var("CDN_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_base_url = env::var("CDN_BASE_URL").unwrap_or(defaults.base_url);
        let allowed_dimensions = match args
            .allowed_dimensions
            .or_else(|| env::var("CDN_ALLOWED_DIMENSIONS").ok())
        {
            Some(raw) => parse_dimensions(&raw)?,
            None => defaults.allowed_dimensions,
        };

        let private_key = env::var("CDN_PRIVATE_KEY").unwrap_or_else(|_| {
            tracing::warn!("CDN_PRIVATE_KEY not set; signed URLs use an insecure default key");
            defaults.private_key
        });
        let admin_token = env::var("CDN_ADMIN_TOKEN").ok().filter(|t| !t.is_empty());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            cache_dir: args.cache_dir.unwrap_or(env_cache),
            database_url: args.database_url.unwrap_or(env_db),
            base_url: args.base_url.unwrap_or(env_base_url),
            private_key,
            admin_token,
            max_age_secs: env_parse("CDN_MAX_AGE_SECS", defaults.max_age_secs)?,
            allowed_dimensions,
            allow_dangerous_transforms: args.allow_dangerous_transforms
                || env_parse("CDN_ALLOW_DANGEROUS_TRANSFORMS", false)?,
            crop_quadrant_portrait: env_parse(
                "CDN_CROP_QUADRANT_PORTRAIT",
                defaults.crop_quadrant_portrait,
            )?,
            crop_quadrant_landscape: env_parse(
                "CDN_CROP_QUADRANT_LANDSCAPE",
                defaults.crop_quadrant_landscape,
            )?,
            crop_quadrant_square: env_parse(
                "CDN_CROP_QUADRANT_SQUARE",
                defaults.crop_quadrant_square,
            )?,
            max_retina: env_parse("CDN_MAX_RETINA", defaults.max_retina)?,
            transform_workers: env_parse("CDN_TRANSFORM_WORKERS", defaults.transform_workers)?,
            transform_queue_timeout_ms: env_parse(
                "CDN_TRANSFORM_QUEUE_TIMEOUT_MS",
                defaults.transform_queue_timeout_ms,
            )?,
            max_upload_bytes: env_parse("CDN_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transform_settings(&self) -> TransformSettings {
        TransformSettings {
            cache_dir: PathBuf::from(&self.cache_dir),
            allowed_dimensions: self.allowed_dimensions.clone(),
            allow_dangerous_transforms: self.allow_dangerous_transforms,
            quadrants: [
                (Orientation::Portrait, self.crop_quadrant_portrait),
                (Orientation::Landscape, self.crop_quadrant_landscape),
                (Orientation::Square, self.crop_quadrant_square),
            ]
            .into_iter()
            .collect(),
            max_retina: self.max_retina.max(1),
            workers: self.transform_workers.max(1),
            queue_timeout: Duration::from_millis(self.transform_queue_timeout_ms),
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            staging_dir: PathBuf::from(&self.cache_dir).join("staging"),
            max_upload_bytes: self.max_upload_bytes,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

/// Parse a comma separated `WxH` list.
pub fn parse_dimensions(raw: &str) -> Result<Vec<(u32, u32)>> {
    let mut dims = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((w, h)) = part.split_once(['x', 'X']) else {
            bail!("dimension `{}` is not of the form WxH", part);
        };
        let w = w.trim().parse::<u32>().with_context(|| format!("width in `{}`", part))?;
        let h = h.trim().parse::<u32>().with_context(|| format!("height in `{}`", part))?;
        dims.push((w, h));
    }
    Ok(dims)
}
