//! Bakes the network credentials from `.env` into the binary.

const REQUIRED: [&str; 2] = ["WIFI_SSID", "WIFI_PASSWORD"];
const DEFAULT_PROBE_URL: &str = "http://example.com/";

fn main() {
    println!("cargo:rustc-link-arg=-Tlinkall.x");
    println!("cargo:rerun-if-changed=.env");

    // A missing .env is fine as long as the variables come from the environment
    let _ = dotenvy::dotenv();

    for key in REQUIRED {
        println!("cargo:rerun-if-env-changed={key}");
        match std::env::var(key) {
            Ok(value) => println!("cargo:rustc-env={key}={value}"),
            Err(_) => panic!("{key} must be set in .env or the environment, see .env.example"),
        }
    }

    println!("cargo:rerun-if-env-changed=WIFI_HOSTNAME");
    if let Ok(hostname) = std::env::var("WIFI_HOSTNAME") {
        println!("cargo:rustc-env=WIFI_HOSTNAME={hostname}");
    }

    println!("cargo:rerun-if-env-changed=HTTP_PROBE_URL");
    let probe_url = std::env::var("HTTP_PROBE_URL").unwrap_or_else(|_| DEFAULT_PROBE_URL.into());
    println!("cargo:rustc-env=HTTP_PROBE_URL={probe_url}");
}
