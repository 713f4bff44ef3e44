/// API generation this client speaks.
pub const API_VERSION_MAJOR: i32 = 1;
/// Lowest minor revision of that generation the client can work with.
pub const API_VERSION_MINOR: i32 = 0;

/// Outcome of the `/ping` compatibility probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersionStatus {
    Unknown,
    Pending,
    Ok,
    Incompatible,
    NotFound,
}

/// Checks a server-reported `"MAJOR.MINOR"` version against the supported
/// range: same major with at least our minor, or any newer major.
pub fn check_api_version(reported: &str) -> ApiVersionStatus {
    let Some((major, minor)) = parse_major_minor(reported) else {
        return ApiVersionStatus::Incompatible;
    };
    if (major == API_VERSION_MAJOR && minor >= API_VERSION_MINOR) || major > API_VERSION_MAJOR {
        ApiVersionStatus::Ok
    } else {
        ApiVersionStatus::Incompatible
    }
}

fn parse_major_minor(value: &str) -> Option<(i32, i32)> {
    let mut parts = value.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    // a trailing patch component ("1.2.3") or suffix is tolerated
    let minor_digits: String = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let minor = minor_digits.parse().ok()?;
    Some((major, minor))
}
