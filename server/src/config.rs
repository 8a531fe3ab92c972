use chrono_tz::Tz;

/// Process-wide configuration, resolved once at startup from the
/// environment. Mirrors the teacher's `AppConfig::from_env()` shape.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string (sqlite in dev/tests, postgres in prod).
    pub database_url: String,

    /// Address the HTTP server binds to.
    pub http_addr: String,

    // =========================
    // Batching / sampling
    // =========================
    /// Maximum number of responses a single collecting batch may hold
    /// before it is sealed.
    pub batch_capacity: usize,

    /// Fallback sample percentage used when no QC config is active for a
    /// (survey, tenant) pair.
    pub fallback_sample_percentage: u8,

    // =========================
    // Dispatcher / leasing
    // =========================
    /// How long a lease stays exclusive before it lapses.
    pub lease_duration_min: i64,

    /// Upper bound on candidate retries within a single `NextAssignment`
    /// call before giving up and returning `None`.
    pub max_dispatch_retries: usize,

    // =========================
    // Scheduler cadence
    // =========================
    /// Interval, in seconds, between Assignment View refreshes.
    pub view_refresh_sec: u64,

    /// Interval, in seconds, between lease GC sweeps.
    pub lease_gc_interval_sec: u64,

    /// IANA timezone used to compute the daily seal boundary.
    pub daily_seal_tz: Tz,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite::memory:".to_string());

        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let batch_capacity = env_usize("BATCH_CAPACITY", 100);
        let fallback_sample_percentage = env_usize("FALLBACK_SAMPLE_PERCENTAGE", 40) as u8;

        let lease_duration_min = env_usize("LEASE_DURATION_MIN", 30) as i64;
        let max_dispatch_retries = env_usize("MAX_DISPATCH_RETRIES", 5);

        let view_refresh_sec = env_usize("VIEW_REFRESH_SEC", 10) as u64;
        let lease_gc_interval_sec = env_usize("LEASE_GC_INTERVAL_SEC", 60) as u64;

        let daily_seal_tz = std::env::var("DAILY_SEAL_TZ")
            .ok()
            .and_then(|s| s.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC);

        Self {
            database_url,
            http_addr,
            batch_capacity,
            fallback_sample_percentage,
            lease_duration_min,
            max_dispatch_retries,
            view_refresh_sec,
            lease_gc_interval_sec,
            daily_seal_tz,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
