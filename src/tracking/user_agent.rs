use woothee::parser::{Parser, WootheeResult};

use crate::models::{BrowserInfo, DeviceType};

const UNKNOWN: &str = "UNKNOWN";

/// Parse a User-Agent header. Never fails: anything woothee cannot make
/// sense of yields an empty `BrowserInfo`.
pub fn parse_user_agent(user_agent: Option<&str>) -> BrowserInfo {
    let Some(ua) = user_agent else {
        return BrowserInfo::default();
    };

    if ua.trim().is_empty() {
        return BrowserInfo::default();
    }

    match Parser::new().parse(ua) {
        Some(result) => from_woothee_result(&result),
        None => BrowserInfo::default(),
    }
}

fn from_woothee_result(result: &WootheeResult) -> BrowserInfo {
    let browser_name = clean(result.name);
    let os_name = clean(result.os);
    let device_type = device_type(result.category);

    if browser_name.is_none() && os_name.is_none() && device_type.is_none() {
        return BrowserInfo::default();
    }

    BrowserInfo {
        browser_name,
        browser_version: clean(result.version),
        os_name,
        os_version: clean(&result.os_version),
        device_type,
    }
}

fn clean(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == UNKNOWN {
        None
    } else {
        Some(value.to_string())
    }
}

/// Phones are mobile; every other recognised category, tablets included,
/// is treated as desktop.
fn device_type(category: &str) -> Option<DeviceType> {
    match category {
        "smartphone" | "mobilephone" => Some(DeviceType::Mobile),
        "" | UNKNOWN => None,
        _ => Some(DeviceType::Desktop),
    }
}
