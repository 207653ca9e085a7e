use once_cell::sync::Lazy;
use std::env;

pub static APP_URL: Lazy<String> = Lazy::new(|| {
    env::var("APP_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
});

pub static STRIPE_API_BASE: Lazy<String> = Lazy::new(|| {
    env::var("STRIPE_API_BASE")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.stripe.com".to_string())
});

pub static DATA_FILE: Lazy<String> =
    Lazy::new(|| env::var("DATA_FILE").unwrap_or_else(|_| "data/billing.json".to_string()));

pub fn success_url(app_url: &str) -> String {
    format!("{app_url}/dashboard?session_id={{CHECKOUT_SESSION_ID}}&success=true")
}

pub fn cancel_url(app_url: &str) -> String {
    format!("{app_url}/pricing?canceled=true")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Supabase,
    Json,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        let supabase_configured = env::var("SUPABASE_URL").is_ok();
        Self::resolve(env::var("STORE_BACKEND").ok().as_deref(), supabase_configured)
    }

    fn resolve(requested: Option<&str>, supabase_configured: bool) -> Self {
        match requested.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("supabase") => StoreBackend::Supabase,
            Some("json") | Some("file") => StoreBackend::Json,
            Some("memory") => StoreBackend::Memory,
            _ if supabase_configured => StoreBackend::Supabase,
            _ => StoreBackend::Json,
        }
    }
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_urls_keep_stripe_placeholder() {
        assert_eq!(
            success_url("https://pixelift.ai"),
            "https://pixelift.ai/dashboard?session_id={CHECKOUT_SESSION_ID}&success=true"
        );
        assert_eq!(cancel_url("https://pixelift.ai"), "https://pixelift.ai/pricing?canceled=true");
    }

    #[test]
    fn store_backend_defaults() {
        assert_eq!(StoreBackend::resolve(None, true), StoreBackend::Supabase);
        assert_eq!(StoreBackend::resolve(None, false), StoreBackend::Json);
        assert_eq!(StoreBackend::resolve(Some("Memory"), true), StoreBackend::Memory);
        assert_eq!(StoreBackend::resolve(Some("bogus"), false), StoreBackend::Json);
    }
}
