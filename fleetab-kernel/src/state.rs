use time::OffsetDateTime;

/// Âge en secondes entières entre deux instants, un instant futur compte pour 0
pub fn age_secs(now: OffsetDateTime, then: OffsetDateTime) -> i64 {
    (now - then).whole_seconds().max(0)
}
