use tokio::time::Duration;

/// Parses a duration string such as "150ms", "30s", "1.5s", "10m", "2h", "1d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
///
/// Fractional values are accepted; negative values are not.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("Missing duration unit in '{}'. Use 'ms', 's', 'm', 'h', or 'd'.", s))?;
    let (value_str, unit) = s.split_at(split);

    let value: f64 = value_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid numeric value in duration: '{}'", value_str))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Invalid numeric value in duration: '{}'", value_str));
    }

    let multiplier = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 60.0 * 60.0,
        "d" => 24.0 * 60.0 * 60.0,
        _ => {
            return Err(format!(
                "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                unit
            ))
        }
    };

    Duration::try_from_secs_f64(value * multiplier)
        .map_err(|e| format!("Duration '{}' out of range: {}", s, e))
}

/// Splits a comma-separated list, honouring `\,` as a literal comma.
///
/// Empty entries are dropped.
pub fn split_escaped_list(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = list.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => {
                if !current.trim().is_empty() {
                    items.push(std::mem::take(&mut current));
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        items.push(current);
    }

    items
}

/// Parses `name=url` pairs separated by commas, e.g.
/// `yarp=http://localhost:8001/api/test,ocelot=http://localhost:8000/api/test`.
pub fn parse_target_list(list: &str) -> Result<Vec<(String, String)>, String> {
    let mut targets = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry
            .split_once('=')
            .ok_or_else(|| format!("Target '{}' is not in the form name=url", entry))?;
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() || url.is_empty() {
            return Err(format!("Target '{}' has an empty name or url", entry));
        }
        targets.push((name.to_string(), url.to_string()));
    }
    Ok(targets)
}
