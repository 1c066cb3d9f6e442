use chrono::Utc;

/// Current unix timestamp in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Expiry timestamp `days` from now, for TTL attributes on store rows.
pub fn ttl_from_days(days: i64) -> i64 {
    unix_now() + days * 24 * 60 * 60
}

pub fn check_expired(expires_at: i64) -> bool {
    unix_now() >= expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_in_the_future() {
        let ttl = ttl_from_days(7);
        assert!(ttl > unix_now());
        assert!(!check_expired(ttl));
        assert!(check_expired(unix_now() - 1));
    }
}
