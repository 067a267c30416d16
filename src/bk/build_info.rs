use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("BOTKEEPER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("BOTKEEPER_BUILD_TIME").unwrap_or("unknown")
}

/// Build time rendered as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        return epoch
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S").to_string();
    }

    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "botkeeper {} (built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_and_rfc3339_render_the_same_instant() {
        assert_eq!(format_build_time("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time("2026-03-01T12:30:00Z"), "2026-03-01 12:30:00");
    }

    #[test]
    fn garbage_epoch_is_unknown() {
        assert_eq!(format_build_time("epoch:nope"), "unknown");
    }
}
