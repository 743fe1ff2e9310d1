//! Build script for the goxfer CLI.
//!
//! This script sets the API base URL at compile time:
//! - Release builds: hardcoded production URL
//! - Debug builds: reads from .env file if present, otherwise localhost

use std::env;
use std::fs;
use std::path::Path;

/// Production API base URL.
const PROD_API_URL: &str = "https://api.goxfer.dev";

/// Default development API base URL.
const DEV_API_URL: &str = "http://localhost:8080";

fn main() {
    // Tell Cargo to rerun this script if .env changes
    println!("cargo::rerun-if-changed=.env");
    println!("cargo::rerun-if-env-changed=PROFILE");

    let profile = env::var("PROFILE").unwrap_or_default();
    let is_release = profile == "release";

    let api_url = if is_release {
        // Release builds always use the production URL
        PROD_API_URL.to_string()
    } else {
        // Debug builds: try to read from .env file
        read_dotenv().unwrap_or_else(|| DEV_API_URL.to_string())
    };

    // Set compile-time environment variable
    println!("cargo::rustc-env=GOXFER_API_URL={}", api_url);
}

/// Reads GOXFER_API_URL from the .env file if it exists.
fn read_dotenv() -> Option<String> {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_default();
    let dotenv_path = Path::new(&manifest_dir).join(".env");

    if !dotenv_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&dotenv_path).ok()?;

    for line in contents.lines() {
        let line = line.trim();

        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Parse KEY=VALUE
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "GOXFER_API_URL" {
                return Some(value.trim().to_string());
            }
        }
    }

    None
}
