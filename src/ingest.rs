//! Raw survey rows: CSV parsing, range validation, and quality flagging.

use std::collections::HashMap;
use std::fmt;
use std::io;

use tracing::warn;

use crate::error::{Result, TurnoverError};
use crate::models::{FormType, QualityFlag, SurveyResponse, ITEM_COUNT};
use crate::stats;

/// Answer spread above which a response is treated as noise.
const VOLATILITY_LIMIT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityIssue {
    Duplicate,
    Constant,
    Volatile,
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityIssue::Duplicate => "duplicate answers",
            QualityIssue::Constant => "constant answers",
            QualityIssue::Volatile => "volatile answers",
        };
        f.write_str(label)
    }
}

/// Non-fatal finding; the row is kept and marked suspicious.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataQualityWarning {
    pub response_id: String,
    pub issue: QualityIssue,
}

pub fn validate_items(responses: &[SurveyResponse]) -> Result<()> {
    for response in responses {
        if let Some((idx, value)) = response
            .items
            .iter()
            .enumerate()
            .find_map(|(idx, v)| v.filter(|v| !(1..=5).contains(v)).map(|v| (idx, v)))
        {
            return Err(TurnoverError::validation(format!(
                "response {}: q{} = {} is outside 1-5",
                response.response_id,
                idx + 1,
                value
            )));
        }
    }
    Ok(())
}

/// Returns a flagged copy of the batch plus one warning per finding.
pub fn flag_quality(responses: &[SurveyResponse]) -> (Vec<SurveyResponse>, Vec<DataQualityWarning>) {
    let mut seen: HashMap<&[Option<u8>], usize> = HashMap::new();
    for response in responses {
        *seen.entry(&response.items[..]).or_default() += 1;
    }

    let mut warnings = Vec::new();
    let flagged = responses
        .iter()
        .map(|response| {
            let answered: Vec<f64> = response.answered().map(f64::from).collect();
            let mut issues = Vec::new();
            if !answered.is_empty() && seen[&response.items[..]] > 1 {
                issues.push(QualityIssue::Duplicate);
            }
            if !answered.is_empty() && answered.iter().all(|v| *v == answered[0]) {
                issues.push(QualityIssue::Constant);
            }
            if stats::sample_std(&answered).is_some_and(|std| std > VOLATILITY_LIMIT) {
                issues.push(QualityIssue::Volatile);
            }

            let mut response = response.clone();
            if !issues.is_empty() {
                response.quality = QualityFlag::Suspicious;
            }
            for issue in issues {
                warn!(response_id = %response.response_id, %issue, "data quality warning");
                warnings.push(DataQualityWarning {
                    response_id: response.response_id.clone(),
                    issue,
                });
            }
            response
        })
        .collect();
    (flagged, warnings)
}

/// Range check then quality flagging; every batch entering feature
/// derivation goes through here, whatever store it was read from.
pub fn screen(responses: &[SurveyResponse]) -> Result<(Vec<SurveyResponse>, Vec<DataQualityWarning>)> {
    validate_items(responses)?;
    Ok(flag_quality(responses))
}

/// Reads upstream survey rows.
///
/// Item columns are `q1`..`q25` and may be absent or empty; columns the
/// pipeline does not know (names, e-mails) are ignored. Without a `target`
/// column the label follows the form type.
pub fn read_responses_csv<R: io::Read>(reader: R) -> Result<Vec<SurveyResponse>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);
    let item_columns: Vec<Option<usize>> = (1..=ITEM_COUNT).map(|q| column(&format!("q{q}"))).collect();
    let id_col = column("response_id");
    let employee_col = column("employee_id");
    let form_col = column("form_type");
    let location_col = column("location");
    let role_col = column("role");
    let age_col = column("age_range");
    let tenure_col = column("tenure_months");
    let target_col = column("target");
    let quality_col = column("data_quality_flag");

    let mut responses = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let response_id = field(id_col).map_or_else(|| format!("row-{}", line + 1), str::to_string);

        let form_type = match field(form_col) {
            Some(raw) => FormType::parse(raw).ok_or_else(|| {
                TurnoverError::validation(format!("response {response_id}: unknown form type {raw:?}"))
            })?,
            None => FormType::ActiveSurvey,
        };

        let mut items = [None; ITEM_COUNT];
        for (slot, idx) in items.iter_mut().zip(&item_columns) {
            *slot = field(*idx)
                .map(|raw| parse_item(raw, &response_id))
                .transpose()?;
        }

        let tenure_months = field(tenure_col)
            .map(|raw| {
                raw.parse::<u32>().map_err(|_| {
                    TurnoverError::validation(format!("response {response_id}: bad tenure {raw:?}"))
                })
            })
            .transpose()?;
        let target = field(target_col)
            .map(|raw| match raw {
                "0" => Ok(0),
                "1" => Ok(1),
                _ => Err(TurnoverError::validation(format!(
                    "response {response_id}: label must be 0 or 1, got {raw:?}"
                ))),
            })
            .transpose()?;

        responses.push(SurveyResponse {
            response_id,
            employee_id: field(employee_col).map(str::to_string),
            form_type,
            items,
            location: field(location_col).map(str::to_string),
            role: field(role_col).map(str::to_string),
            age_range: field(age_col).map(str::to_string),
            tenure_months,
            target,
            quality: field(quality_col).map_or(QualityFlag::Ok, QualityFlag::parse),
        });
    }
    Ok(responses)
}

fn parse_item(raw: &str, response_id: &str) -> Result<u8> {
    let value: u8 = raw
        .parse()
        .map_err(|_| TurnoverError::validation(format!("response {response_id}: bad item score {raw:?}")))?;
    if (1..=5).contains(&value) {
        Ok(value)
    } else {
        Err(TurnoverError::validation(format!(
            "response {response_id}: item score {value} is outside 1-5"
        )))
    }
}

pub fn write_responses_csv<W: io::Write>(writer: W, responses: &[SurveyResponse]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = [
        "response_id",
        "employee_id",
        "form_type",
        "location",
        "role",
        "age_range",
        "tenure_months",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect();
    header.extend((1..=ITEM_COUNT).map(|q| format!("q{q}")));
    header.push("target".to_string());
    header.push("data_quality_flag".to_string());
    writer.write_record(&header)?;

    let text = |value: &Option<String>| value.clone().unwrap_or_default();
    for response in responses {
        let mut record = vec![
            response.response_id.clone(),
            text(&response.employee_id),
            response.form_type.as_str().to_string(),
            text(&response.location),
            text(&response.role),
            text(&response.age_range),
            response
                .tenure_months
                .map(|t| t.to_string())
                .unwrap_or_default(),
        ];
        record.extend(
            response
                .items
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
        );
        record.push(response.label().to_string());
        record.push(response.quality.as_str().to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tests::response;

    fn graded() -> [Option<u8>; ITEM_COUNT] {
        std::array::from_fn(|i| Some((i % 4) as u8 + 2))
    }

    #[test]
    fn duplicates_are_flagged_not_dropped() {
        let batch = vec![response("a", graded()), response("b", graded())];
        let (flagged, warnings) = flag_quality(&batch);
        assert_eq!(flagged.len(), 2);
        assert!(flagged.iter().all(|r| r.quality == QualityFlag::Suspicious));
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.issue == QualityIssue::Duplicate));
    }

    #[test]
    fn constant_answers_are_suspicious() {
        let batch = vec![response("a", [Some(5); ITEM_COUNT]), response("b", graded())];
        let (flagged, warnings) = flag_quality(&batch);
        assert_eq!(flagged[0].quality, QualityFlag::Suspicious);
        assert_eq!(flagged[1].quality, QualityFlag::Ok);
        assert_eq!(
            warnings,
            vec![DataQualityWarning {
                response_id: "a".to_string(),
                issue: QualityIssue::Constant,
            }]
        );
    }

    #[test]
    fn volatile_answers_are_suspicious() {
        let items = std::array::from_fn(|i| Some(if i % 2 == 0 { 1 } else { 5 }));
        let (flagged, warnings) = flag_quality(&[response("a", items)]);
        assert_eq!(flagged[0].quality, QualityFlag::Suspicious);
        assert_eq!(warnings[0].issue, QualityIssue::Volatile);
    }

    #[test]
    fn out_of_range_items_fail_validation() {
        let mut items = graded();
        items[7] = Some(6);
        let err = validate_items(&[response("a", items)]).unwrap_err();
        assert!(err.to_string().contains("q8"));
    }

    #[test]
    fn screening_rejects_stored_out_of_range_items() {
        let mut items = graded();
        items[3] = Some(7);
        let batch = vec![response("a", graded()), response("b", items)];
        let err = screen(&batch).unwrap_err();
        assert!(matches!(err, TurnoverError::Validation(_)));
        assert!(err.to_string().contains("response b: q4 = 7"));

        let mut zero = graded();
        zero[0] = Some(0);
        assert!(screen(&[response("c", zero)]).is_err());
    }

    #[test]
    fn screening_flags_valid_batches() {
        let batch = vec![response("a", graded()), response("b", [Some(3); ITEM_COUNT])];
        let (screened, warnings) = screen(&batch).unwrap();
        assert_eq!(screened.len(), 2);
        assert_eq!(screened[1].quality, QualityFlag::Suspicious);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn csv_tolerates_missing_item_columns_and_pii() {
        let csv = "response_id,Name,form_type,location,role,age_range,tenure_months,q1,q2,q3\n\
                   r1,Ana,exit-interview,Recife,Analyst,26-35,14,2,1,\n";
        let responses = read_responses_csv(csv.as_bytes()).unwrap();
        assert_eq!(responses.len(), 1);
        let r = &responses[0];
        assert_eq!(r.items[0], Some(2));
        assert_eq!(r.items[2], None);
        assert_eq!(r.items[24], None);
        assert_eq!(r.label(), 1);
        assert_eq!(r.tenure_months, Some(14));
    }

    #[test]
    fn csv_rejects_out_of_range_scores() {
        let csv = "response_id,q1\nr1,9\n";
        assert!(matches!(
            read_responses_csv(csv.as_bytes()),
            Err(TurnoverError::Validation(_))
        ));
    }

    #[test]
    fn csv_round_trip_keeps_responses() {
        let batch = vec![response("a", graded()), response("b", [Some(3); ITEM_COUNT])];
        let mut buffer = Vec::new();
        write_responses_csv(&mut buffer, &batch).unwrap();
        let back = read_responses_csv(buffer.as_slice()).unwrap();
        assert_eq!(back, batch);
    }
}
