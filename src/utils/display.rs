use chrono::{DateTime, Duration, Utc};

/// Elapsed time since the given instant
pub fn get_elapsed_time(time: DateTime<Utc>) -> Duration {
    Utc::now().signed_duration_since(time)
}

/// Render a duration as `hh:mm:ss` or `{d} days hh:mm:ss`
pub fn format_elapsed_time(elapsed: Duration) -> String {
    let days = elapsed.num_days();
    let hours = elapsed.num_hours() - (days * 24);
    let minutes = elapsed.num_minutes() - (days * 1440) - (hours * 60);
    let seconds = elapsed.num_seconds() - (days * 86_400) - (hours * 3600) - (minutes * 60);
    if days > 0 {
        format!("{} days {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Age of the given instant as `hh:mm:ss`
pub fn format_time_as_elapsed(time: DateTime<Utc>) -> String {
    format_elapsed_time(get_elapsed_time(time))
}

/// Render an ASN in asdot notation when it does not fit 16 bits
pub fn u32_to_dotted(asn: u32, separator: char) -> String {
    if asn < u32::from(std::u16::MAX) {
        format!("{}", asn)
    } else {
        format!("{}{}{}", asn >> 16, separator, asn & 0xffff)
    }
}
