use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "SYMDEX_LOG";

const DEFAULT_LEVEL: &str = "warn";

/// Install the global stderr subscriber. Safe to call more than once.
pub fn init(json: bool) {
    let level = std::env::var(ENV_LOG).unwrap_or_default();
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = env_filter(&level, rust_log.as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// `SYMDEX_LOG` provides the base directives; `RUST_LOG` is appended so it can
/// refine individual targets.
pub fn env_filter(level: &str, rust_log: Option<&str>) -> EnvFilter {
    let base = normalize_level_directives(level);
    let base_filter =
        || EnvFilter::try_new(&base).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    match rust_log.map(str::trim).filter(|value| !value.is_empty()) {
        Some(env) => EnvFilter::try_new(format!("{base},{env}"))
            .or_else(|_| EnvFilter::try_new(env))
            .unwrap_or_else(|_| base_filter()),
        None => base_filter(),
    }
}

fn normalize_level_directives(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return DEFAULT_LEVEL.to_owned();
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "trace" => "trace".to_owned(),
        "debug" => "debug".to_owned(),
        "info" => "info".to_owned(),
        "warn" | "warning" => "warn".to_owned(),
        "error" => "error".to_owned(),
        "off" | "none" => "off".to_owned(),
        _ => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_synonyms_are_normalized() {
        assert_eq!(normalize_level_directives(""), "warn");
        assert_eq!(normalize_level_directives(" WARNING "), "warn");
        assert_eq!(normalize_level_directives("Debug"), "debug");
        assert_eq!(
            normalize_level_directives("symdex.cache=trace"),
            "symdex.cache=trace"
        );
    }

    #[test]
    fn rust_log_refines_base_level() {
        let filter = env_filter("info", Some("symdex.cache=trace"));
        let rendered = filter.to_string();
        assert!(rendered.contains("symdex.cache=trace"), "{rendered}");
        assert!(rendered.contains("info"), "{rendered}");
    }

    #[test]
    fn malformed_directives_fall_back() {
        let filter = env_filter("symdex=loud", Some("symdex.cache=louder"));
        assert_eq!(filter.to_string(), "warn");
    }
}
