//! Mapping of raw measure reports into [`ScanResult`] records.
//!
//! The report is the body of `/api/measures/component`: a `component` object
//! carrying a name and an ordered list of `{metric, value, bestValue?}`
//! measures. Ten metric keys are recognised; anything else is skipped.
//!
//! When the same metric appears more than once the last occurrence wins.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric keys requested from the analysis service. Versioned with the
/// mapper: changing this list means changing [`parse`] too.
pub const REQUESTED_METRIC_KEYS: &[&str] = &[
    "bugs",
    "new_bugs",
    "code_smells",
    "vulnerabilities",
    "new_vulnerabilities",
    "coverage",
    "sqale_rating",
    "reliability_rating",
    "security_rating",
    "security_review_rating",
    "security_hotspots",
    "complexity",
];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("no report text was supplied")]
    MissingReport,

    #[error("report is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("metric `{metric}` has unparseable value {value:?}")]
    InvalidMetric {
        metric: &'static str,
        value: Option<String>,
    },
}

/// Normalized analysis result, one row per scan.
///
/// Ratings use the service's 1.0–5.0 scale, coverage is a percentage.
/// Metrics missing from a report stay at zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub name: String,
    pub scale_rating: f64,
    pub security_review_rating: f64,
    pub reliability_rating: f64,
    pub code_smells: i32,
    pub bugs: i32,
    pub vulnerabilities: i32,
    pub coverage: f64,
    pub security_rating: f64,
    pub security_hotspots: i32,
    pub complexity: i32,
}

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    #[serde(default)]
    component: Option<Component>,
}

#[derive(Debug, Deserialize)]
struct Component {
    #[serde(default)]
    name: String,
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Measure {
    metric: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    best_value: Option<bool>,
}

/// Parse a raw report. `None` is a caller contract violation and is reported
/// as [`ReportError::MissingReport`] rather than an empty result.
pub fn parse(report: Option<&str>) -> Result<ScanResult, ReportError> {
    let text = report.ok_or(ReportError::MissingReport)?;
    let response: MeasuresResponse = serde_json::from_str(text)?;

    let mut result = ScanResult::default();
    let Some(component) = response.component else {
        return Ok(result);
    };

    result.name = component.name;
    for measure in &component.measures {
        apply(&mut result, measure)?;
    }

    Ok(result)
}

fn apply(result: &mut ScanResult, measure: &Measure) -> Result<(), ReportError> {
    match measure.metric.as_str() {
        "sqale_rating" => result.scale_rating = rating(measure, "sqale_rating")?,
        "security_review_rating" => {
            result.security_review_rating = rating(measure, "security_review_rating")?
        }
        "reliability_rating" => {
            result.reliability_rating = rating(measure, "reliability_rating")?
        }
        "code_smells" => result.code_smells = count(measure, "code_smells")?,
        "bugs" => result.bugs = count(measure, "bugs")?,
        "vulnerabilities" => result.vulnerabilities = count(measure, "vulnerabilities")?,
        "coverage" => result.coverage = rating(measure, "coverage")?,
        "security_rating" => result.security_rating = rating(measure, "security_rating")?,
        "security_hotspots" => {
            result.security_hotspots = count(measure, "security_hotspots")?
        }
        "complexity" => result.complexity = count(measure, "complexity")?,
        _ => {}
    }
    Ok(())
}

fn rating(measure: &Measure, metric: &'static str) -> Result<f64, ReportError> {
    measure
        .value
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .ok_or_else(|| ReportError::InvalidMetric {
            metric,
            value: measure.value.clone(),
        })
}

fn count(measure: &Measure, metric: &'static str) -> Result<i32, ReportError> {
    measure
        .value
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .ok_or_else(|| ReportError::InvalidMetric {
            metric,
            value: measure.value.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(measures: serde_json::Value) -> String {
        json!({
            "component": {
                "id": "AYwBnFz-YvxQjtTbAh4D",
                "key": "inventory_1699625745679",
                "name": "inventory_1699625745679",
                "qualifier": "TRK",
                "measures": measures,
            }
        })
        .to_string()
    }

    fn fixture_measures() -> serde_json::Value {
        json!([
            {"metric": "coverage", "value": "0.0", "bestValue": false},
            {"metric": "reliability_rating", "value": "1.0", "bestValue": true},
            {"metric": "complexity", "value": "36"},
            {"metric": "bugs", "value": "0", "bestValue": true},
            {"metric": "code_smells", "value": "9", "bestValue": false},
            {"metric": "security_rating", "value": "1.0", "bestValue": true},
            {"metric": "vulnerabilities", "value": "0", "bestValue": true},
            {"metric": "security_review_rating", "value": "1.0", "bestValue": true},
            {"metric": "security_hotspots", "value": "0", "bestValue": true},
            {"metric": "sqale_rating", "value": "1.0", "bestValue": true}
        ])
    }

    fn expected_fixture() -> ScanResult {
        ScanResult {
            name: "inventory_1699625745679".into(),
            scale_rating: 1.0,
            security_review_rating: 1.0,
            reliability_rating: 1.0,
            code_smells: 9,
            bugs: 0,
            vulnerabilities: 0,
            coverage: 0.0,
            security_rating: 1.0,
            security_hotspots: 0,
            complexity: 36,
        }
    }

    #[test]
    fn maps_sample_report() {
        let text = report(fixture_measures());
        let result = parse(Some(&text)).expect("valid report");
        assert_eq!(result, expected_fixture());
    }

    #[test]
    fn metric_order_does_not_matter() {
        let mut measures = fixture_measures().as_array().cloned().unwrap_or_default();
        measures.reverse();
        let text = report(serde_json::Value::Array(measures));

        assert_eq!(parse(Some(&text)).expect("valid"), expected_fixture());
    }

    #[test]
    fn unknown_metrics_are_ignored() {
        let mut measures = fixture_measures().as_array().cloned().unwrap_or_default();
        measures.push(json!({"metric": "new_bugs", "value": "not-a-number"}));
        measures.push(json!({"metric": "ncloc", "value": "1200"}));
        let text = report(serde_json::Value::Array(measures));

        assert_eq!(parse(Some(&text)).expect("valid"), expected_fixture());
    }

    #[test]
    fn missing_report_is_a_contract_violation() {
        assert!(matches!(parse(None), Err(ReportError::MissingReport)));
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            parse(Some("{\"component\": ")),
            Err(ReportError::Malformed(_))
        ));
    }

    #[test]
    fn report_without_component_yields_zero_result() {
        let result = parse(Some(r#"{"errors": []}"#)).expect("lenient");
        assert_eq!(result, ScanResult::default());

        let result = parse(Some(r#"{"component": null}"#)).expect("lenient");
        assert_eq!(result, ScanResult::default());
    }

    #[test]
    fn absent_metrics_default_to_zero() {
        let text = report(json!([{"metric": "bugs", "value": "4"}]));
        let result = parse(Some(&text)).expect("valid");

        assert_eq!(result.bugs, 4);
        assert_eq!(result.code_smells, 0);
        assert_eq!(result.coverage, 0.0);
    }

    #[test]
    fn duplicate_metrics_keep_the_last_value() {
        let text = report(json!([
            {"metric": "code_smells", "value": "3"},
            {"metric": "code_smells", "value": "11"}
        ]));
        assert_eq!(parse(Some(&text)).expect("valid").code_smells, 11);
    }

    #[test]
    fn unparseable_recognised_metric_is_an_error() {
        let text = report(json!([{"metric": "bugs", "value": "many"}]));
        match parse(Some(&text)) {
            Err(ReportError::InvalidMetric { metric, value }) => {
                assert_eq!(metric, "bugs");
                assert_eq!(value.as_deref(), Some("many"));
            }
            other => panic!("expected metric error, got {other:?}"),
        }

        let fractional_count = report(json!([{"metric": "complexity", "value": "3.5"}]));
        assert!(parse(Some(&fractional_count)).is_err());

        let missing_value = report(json!([{"metric": "coverage"}]));
        assert!(parse(Some(&missing_value)).is_err());
    }
}
