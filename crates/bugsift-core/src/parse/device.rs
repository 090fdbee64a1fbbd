//! Preamble scanner: device identity, report time, uptime, battery.
//!
//! Fed every line the source reader does not route to the logcat parser.
//! Each field latches on first match; once everything interesting has been
//! seen the scanner becomes a no-op.

use crate::parse::time::TimeAnchor;
use crate::types::{BatteryInfo, DeviceInfo};
use chrono::NaiveDate;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_FINGERPRINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*Build fingerprint:\s*(?P<fp>.+?)\s*$").unwrap());
static RE_SDK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bro\.build\.version\.sdk\s*=\s*(?P<sdk>\d+)\b").unwrap());
static RE_RELEASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bro\.build\.version\.release\s*=\s*(?P<rel>\S+)").unwrap());
static RE_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bro\.product\.model\s*=\s*(?P<model>.+?)\s*$").unwrap());
static RE_BRAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bro\.product\.brand\s*=\s*(?P<brand>.+?)\s*$").unwrap());
static RE_BUILD_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bro\.build\.id\s*=\s*(?P<bid>\S+)").unwrap());
static RE_TIMEZONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"persist\.sys\.timezone\s*=\s*(?P<tz>\S+)").unwrap());
static RE_DUMPSTATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"dumpstate:\s*(?P<y>\d{4})-(?P<m>\d{2})-(?P<d>\d{2})(?:\s+(?P<rest>\d{2}:\d{2}:\d{2}))?")
        .unwrap()
});
// Build ids embed a date: TQ3A.230605.012 -> 2023-06-05.
static RE_BUILD_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2})(\d{2})(\d{2})\.(\d{3})").unwrap());
static RE_UPTIME_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<n>\d+)\s*(?P<unit>week|day|hour|min|sec)").unwrap());

pub struct DeviceScanner {
    device: DeviceInfo,
    timezone: Option<String>,
    report_date: Option<NaiveDate>,
    report_date_is_exact: bool,
    in_battery_block: bool,
    battery_level: Option<i32>,
    battery_temp: Option<i32>,
    battery_status: Option<i32>,
}

impl DeviceScanner {
    pub fn new() -> Self {
        Self {
            device: DeviceInfo::default(),
            timezone: None,
            report_date: None,
            report_date_is_exact: false,
            in_battery_block: false,
            battery_level: None,
            battery_temp: None,
            battery_status: None,
        }
    }

    pub fn observe(&mut self, line: &str) {
        if line.len() > 512 {
            return;
        }

        if self.device.fingerprint.is_empty() && line.contains("Build fingerprint") {
            if let Some(c) = RE_FINGERPRINT.captures(line) {
                self.device.fingerprint = c["fp"].trim().trim_matches('\'').to_string();
            }
        }
        if line.contains("ro.build") || line.contains("ro.product") {
            self.observe_prop(line);
        }
        if self.timezone.is_none() && line.contains("persist.sys.timezone") {
            if let Some(c) = RE_TIMEZONE.captures(line) {
                self.timezone = Some(c["tz"].to_string());
            }
        }
        if !self.report_date_is_exact && line.contains("dumpstate:") {
            if let Some(c) = RE_DUMPSTATE.captures(line) {
                let ymd = (
                    c["y"].parse::<i32>().ok(),
                    c["m"].parse::<u32>().ok(),
                    c["d"].parse::<u32>().ok(),
                );
                if let (Some(y), Some(m), Some(d)) = ymd {
                    if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                        self.report_date = Some(date);
                        self.report_date_is_exact = true;
                        let time = c.name("rest").map(|m| m.as_str()).unwrap_or("00:00:00");
                        self.device.report_time = format!("{}T{}", date.format("%Y-%m-%d"), time);
                    }
                }
            }
        }
        if self.device.uptime_ms == 0 && line.trim_start().starts_with("Uptime:") {
            self.device.uptime_ms = parse_uptime_ms(line);
        }
        self.observe_battery(line);
    }

    fn observe_prop(&mut self, line: &str) {
        if self.device.android_version.is_empty() {
            if let Some(c) = RE_RELEASE.captures(line) {
                self.device.android_version = c["rel"].to_string();
            }
        }
        if self.device.api_level == 0 {
            if let Some(c) = RE_SDK.captures(line) {
                self.device.api_level = c["sdk"].parse().unwrap_or(0);
            }
        }
        if self.device.model.is_empty() {
            if let Some(c) = RE_MODEL.captures(line) {
                self.device.model = c["model"].trim().to_string();
            }
        }
        if self.device.brand.is_empty() {
            if let Some(c) = RE_BRAND.captures(line) {
                self.device.brand = c["brand"].trim().to_string();
            }
        }
        if self.device.build_id.is_empty() {
            if let Some(c) = RE_BUILD_ID.captures(line) {
                self.device.build_id = c["bid"].to_string();
                if !self.report_date_is_exact {
                    self.report_date = build_id_date(&self.device.build_id);
                }
            }
        }
    }

    // dumpsys battery block:
    //   Current Battery Service state:
    //     level: 73
    //     temperature: 297
    //     status: 2
    fn observe_battery(&mut self, line: &str) {
        if line.contains("Current Battery Service state") {
            self.in_battery_block = true;
            return;
        }
        if !self.in_battery_block {
            return;
        }
        let trimmed = line.trim_start();
        if let Some(v) = trimmed.strip_prefix("level:") {
            self.battery_level = self.battery_level.or_else(|| v.trim().parse().ok());
        } else if let Some(v) = trimmed.strip_prefix("temperature:") {
            self.battery_temp = self.battery_temp.or_else(|| v.trim().parse().ok());
        } else if let Some(v) = trimmed.strip_prefix("status:") {
            self.battery_status = self.battery_status.or_else(|| v.trim().parse().ok());
        } else if trimmed.is_empty() || !line.starts_with(' ') {
            self.in_battery_block = false;
        }
    }

    pub fn timezone_name(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn anchor(&self) -> TimeAnchor {
        TimeAnchor {
            tz: self.timezone.as_deref().and_then(|s| s.parse::<Tz>().ok()),
            report_date: self.report_date,
        }
    }

    pub fn finish(self) -> DeviceInfo {
        let mut device = self.device;
        if device.battery.is_none() {
            if let (Some(level), Some(temp)) = (self.battery_level, self.battery_temp) {
                device.battery = Some(BatteryInfo {
                    level,
                    temp_c: temp as f32 / 10.0,
                    status: battery_status_label(self.battery_status),
                });
            }
        }
        device
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn build_id_date(build_id: &str) -> Option<NaiveDate> {
    let c = RE_BUILD_DATE.captures(build_id)?;
    let y: i32 = 2000 + c[1].parse::<i32>().ok()?;
    let m: u32 = c[2].parse().ok()?;
    let d: u32 = c[3].parse().ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

// "Uptime: up 0 weeks, 2 days, 3 hours, 4 minutes"
fn parse_uptime_ms(line: &str) -> i64 {
    let mut total: i64 = 0;
    for c in RE_UPTIME_PART.captures_iter(line) {
        let n: i64 = match c["n"].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let unit_ms = match &c["unit"] {
            "week" => 7 * 24 * 3_600_000,
            "day" => 24 * 3_600_000,
            "hour" => 3_600_000,
            "min" => 60_000,
            "sec" => 1_000,
            _ => 0,
        };
        total += n * unit_ms;
    }
    total
}

fn battery_status_label(code: Option<i32>) -> String {
    match code {
        Some(2) => "charging",
        Some(3) => "discharging",
        Some(4) => "not charging",
        Some(5) => "full",
        _ => "unknown",
    }
    .to_string()
}
