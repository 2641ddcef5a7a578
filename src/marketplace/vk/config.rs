use once_cell::sync::Lazy;
use std::env;

pub const DEFAULT_API_VERSION: &str = "5.199";

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("VK_API_ROOT")
        .map(|root| root.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.vk.com/method".to_string())
});
