use anyhow::Result;
use std::time::Duration;

/// Split `s3://bucket/key` (or mc-style `s3/bucket/key`) into bucket and optional key
pub fn parse_s3_path(path: &str) -> Result<(String, Option<String>)> {
    let path = path.trim();

    let stripped = if let Some(p) = path.strip_prefix("s3://") {
        p
    } else if let Some(p) = path.strip_prefix("s3/") {
        p
    } else {
        anyhow::bail!("Invalid S3 path '{}'. Expected: s3://bucket/key", path);
    };

    let (bucket, key) = match stripped.split_once('/') {
        Some((bucket, key)) => (bucket, Some(key).filter(|k| !k.is_empty())),
        None => (stripped, None),
    };
    if bucket.is_empty() {
        anyhow::bail!("Bucket name cannot be empty");
    }

    Ok((bucket.to_string(), key.map(str::to_string)))
}

/// Like `parse_s3_path` but the key is mandatory
pub fn parse_object_path(path: &str) -> Result<(String, String)> {
    match parse_s3_path(path)? {
        (bucket, Some(key)) => Ok((bucket, key)),
        (_, None) => anyhow::bail!("Object key required in '{}'", path),
    }
}

/// Parse a lifetime such as `900`, `90s`, `15m`, `12h` or `7d`
pub fn parse_expiry(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid expiry '{}'", raw))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => anyhow::bail!("Unknown expiry unit '{}' in '{}'", unit, raw),
    };
    Ok(Duration::from_secs(seconds))
}
