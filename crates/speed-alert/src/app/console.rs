//! Console overlay: one status line per tick on stdout

use speed_limit_lib::{ReportSink, TickReport, fallback, utils};
use std::io::Write;

/// Prints every report as a single line
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn publish(&self, report: &TickReport) {
        let line = format_report(report);
        // A closed stdout is not worth stopping the drive for
        let _ = writeln!(std::io::stdout().lock(), "{line}");
    }
}

/// Render a report the way the overlay shows it
///
/// Countries that sign limits in mph get mph for both speed and limit.
pub fn format_report(report: &TickReport) -> String {
    let mph = fallback::uses_mph(report.country.as_deref());
    let (unit, convert): (&str, fn(i32) -> i32) = if mph {
        ("mph", |kmh| utils::kmh_to_mph(f64::from(kmh)).round() as i32)
    } else {
        ("km/h", |kmh| kmh)
    };

    let speed = if report.has_fix {
        format!("{:>3} {unit}", convert(report.speed_kmh))
    } else {
        format!("--- {unit}")
    };
    let limit = if report.limit_kmh > 0 {
        format!("limit {:>3} ({})", convert(report.limit_kmh), report.source)
    } else {
        "limit ---".to_string()
    };

    let mut line = format!("{speed} | {limit}");
    if report.overspeed {
        line.push_str(" | OVERSPEED");
    }
    if report.alert {
        line.push_str(" \x07");
    }
    if report.accuracy_m >= 0.0 {
        line.push_str(&format!(" | ±{:.0}m", report.accuracy_m));
    }
    if let Some(country) = &report.country {
        line.push_str(&format!(" | {}", country.to_ascii_uppercase()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use speed_limit_lib::LimitSource;

    fn report() -> TickReport {
        TickReport {
            speed_kmh: 87,
            limit_kmh: 80,
            overspeed: false,
            accuracy_m: 4.2,
            has_fix: true,
            alert: false,
            source: LimitSource::RawOverpass,
            country: Some("nl".to_string()),
        }
    }

    #[test]
    fn test_metric_line() {
        assert_eq!(
            format_report(&report()),
            " 87 km/h | limit  80 (raw-overpass) | ±4m | NL"
        );
    }

    #[test]
    fn test_mph_country() {
        let line = format_report(&TickReport {
            speed_kmh: 113,
            limit_kmh: 113,
            country: Some("gb".to_string()),
            source: LimitSource::Fallback(Some("gb".to_string())),
            ..report()
        });
        assert_eq!(line, " 70 mph | limit  70 (fallback:gb) | ±4m | GB");
    }

    #[test]
    fn test_overspeed_alert_without_fix_or_limit() {
        let line = format_report(&TickReport {
            overspeed: true,
            alert: true,
            ..report()
        });
        assert!(line.contains("OVERSPEED"));
        assert!(line.contains('\x07'));

        let line = format_report(&TickReport {
            has_fix: false,
            limit_kmh: -1,
            accuracy_m: -1.0,
            country: None,
            source: LimitSource::None,
            ..report()
        });
        assert_eq!(line, "--- km/h | limit ---");
    }
}
