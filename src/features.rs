//! Theme aggregation and feature derivation.
//!
//! Each stage takes an immutable input and returns a new value:
//! responses -> [`ThemeScores`] / [`ResponseAggregates`] -> [`FeatureTable`].
//! Batch-level encodings (role codes, location dummies, tenure range) are
//! fitted once per batch by [`Demographics::fit`].

use std::collections::BTreeSet;
use std::io;

use tracing::warn;

use crate::error::{Result, TurnoverError};
use crate::models::{
    FeatureVector, QualityFlag, Summary, SurveyResponse, Theme, ThemeScores, ITEM_COUNT,
    LOCATION_PREFIX,
};
use crate::stats;

pub const AGE_BRACKETS: [&str; 4] = ["18-25", "26-35", "36-45", "46-60+"];
const TENURE_EPSILON: f64 = 1e-6;
const RED_FLAG_MAX: u8 = 2;
const YELLOW_FLAG_VALUE: u8 = 3;

const ID_COLUMN: &str = "response_id";
const TARGET_COLUMN: &str = "target";
const QUALITY_COLUMN: &str = "data_quality_flag";

fn summarize(values: impl Iterator<Item = u8>) -> Summary {
    let values: Vec<f64> = values.map(f64::from).collect();
    Summary {
        mean: stats::mean(&values),
        std: stats::sample_std(&values),
    }
}

pub fn theme_scores(items: &[Option<u8>; ITEM_COUNT]) -> ThemeScores {
    ThemeScores::from_fn(|theme| summarize(items[theme.items()].iter().flatten().copied()))
}

/// Per-response values that do not depend on the rest of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseAggregates {
    pub themes: ThemeScores,
    pub overall: Summary,
    pub red_flag_count: u32,
    pub yellow_flag_count: u32,
}

impl ResponseAggregates {
    pub fn from_response(response: &SurveyResponse) -> Self {
        let red_flag_count = response.answered().filter(|&v| v <= RED_FLAG_MAX).count() as u32;
        let yellow_flag_count = response
            .answered()
            .filter(|&v| v == YELLOW_FLAG_VALUE)
            .count() as u32;
        Self {
            themes: theme_scores(&response.items),
            overall: summarize(response.answered()),
            red_flag_count,
            yellow_flag_count,
        }
    }

    /// Product of two theme means; a missing operand degrades to 0.
    pub fn interaction(&self, a: Theme, b: Theme) -> f64 {
        match (self.themes.get(a).mean, self.themes.get(b).mean) {
            (Some(x), Some(y)) => x * y,
            _ => 0.0,
        }
    }
}

pub fn age_code(bracket: Option<&str>) -> u8 {
    bracket
        .and_then(|b| AGE_BRACKETS.iter().position(|known| *known == b.trim()))
        .map_or(0, |idx| idx as u8)
}

pub fn location_column(location: &str) -> String {
    let slug: String = location
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{LOCATION_PREFIX}{slug}")
}

/// Encoders fitted on one batch of responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Demographics {
    roles: Vec<String>,
    locations: Vec<String>,
    tenure_range: Option<(f64, f64)>,
}

impl Demographics {
    pub fn fit(responses: &[SurveyResponse]) -> Self {
        let roles: BTreeSet<&str> = responses.iter().filter_map(|r| r.role.as_deref()).collect();
        let locations: BTreeSet<&str> = responses
            .iter()
            .filter_map(|r| r.location.as_deref())
            .collect();
        let tenure_range = stats::min_max(
            responses
                .iter()
                .filter_map(|r| r.tenure_months)
                .map(f64::from),
        );
        Self {
            roles: roles.into_iter().map(str::to_string).collect(),
            // drop-first: the lexically smallest location is the reference level
            locations: locations.into_iter().skip(1).map(str::to_string).collect(),
            tenure_range,
        }
    }

    /// Category code in lexical order, -1 for a missing role.
    pub fn role_code(&self, role: Option<&str>) -> i32 {
        role.and_then(|r| self.roles.iter().position(|known| known == r))
            .map_or(-1, |idx| idx as i32)
    }

    pub fn tenure(&self, months: Option<u32>) -> Option<f64> {
        let (min, max) = self.tenure_range?;
        months.map(|t| (f64::from(t) - min) / (max - min + TENURE_EPSILON))
    }

    pub fn location_columns(&self) -> Vec<String> {
        self.locations.iter().map(|l| location_column(l)).collect()
    }

    fn location_indicators(&self, location: Option<&str>) -> Vec<f64> {
        self.locations
            .iter()
            .map(|l| if Some(l.as_str()) == location { 1.0 } else { 0.0 })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub response_id: String,
    pub values: Vec<Option<f64>>,
    pub target: Option<u8>,
    pub quality: QualityFlag,
}

/// Column-named feature rows; missing values stay `None` until training
/// imputes them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureTable {
    columns: Vec<String>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>, rows: Vec<FeatureRow>) -> Result<Self> {
        let unique: BTreeSet<&String> = columns.iter().collect();
        if unique.len() != columns.len() {
            return Err(TurnoverError::validation("duplicate feature column"));
        }
        if let Some(row) = rows.iter().find(|row| row.values.len() != columns.len()) {
            return Err(TurnoverError::validation(format!(
                "row {} has {} values for {} columns",
                row.response_id,
                row.values.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Reorders to `schema`, zero-filling columns this table lacks.
    ///
    /// Columns outside `schema` cannot be represented and are reported.
    pub fn align_to(&self, schema: &[String]) -> FeatureTable {
        let sources: Vec<Option<usize>> = schema.iter().map(|c| self.column_index(c)).collect();
        let missing: Vec<&str> = schema
            .iter()
            .zip(&sources)
            .filter(|(_, source)| source.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(columns = ?missing, "zero-filling columns absent from feature table");
        }
        let extra: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| !schema.contains(c))
            .map(String::as_str)
            .collect();
        if !extra.is_empty() {
            warn!(columns = ?extra, "feature table columns not in schema are not carried");
        }

        let rows = self
            .rows
            .iter()
            .map(|row| FeatureRow {
                values: sources
                    .iter()
                    .map(|source| match source {
                        Some(idx) => row.values[*idx],
                        None => Some(0.0),
                    })
                    .collect(),
                ..row.clone()
            })
            .collect();
        FeatureTable {
            columns: schema.to_vec(),
            rows,
        }
    }

    /// Appends `other`, taking the union of both column sets.
    pub fn concat(&self, other: &FeatureTable) -> FeatureTable {
        let mut columns = self.columns.clone();
        columns.extend(
            other
                .columns
                .iter()
                .filter(|c| !self.columns.contains(c))
                .cloned(),
        );
        let mut left = self.align_to(&columns);
        left.rows.extend(other.align_to(&columns).rows);
        left
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        let mut header = vec![ID_COLUMN.to_string()];
        header.extend(self.columns.iter().cloned());
        header.push(TARGET_COLUMN.to_string());
        header.push(QUALITY_COLUMN.to_string());
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.response_id.clone()];
            record.extend(
                row.values
                    .iter()
                    .map(|v| v.map(|x| x.to_string()).unwrap_or_default()),
            );
            record.push(row.target.map(|t| t.to_string()).unwrap_or_default());
            record.push(row.quality.as_str().to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a table written by [`FeatureTable::write_csv`]; column order is
    /// taken from the header.
    pub fn read_csv<R: io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let mut id_idx = None;
        let mut target_idx = None;
        let mut quality_idx = None;
        let mut feature_idx = Vec::new();
        let mut columns = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            match name {
                ID_COLUMN => id_idx = Some(idx),
                "employee_id" | "created_at" => {}
                TARGET_COLUMN => target_idx = Some(idx),
                QUALITY_COLUMN => quality_idx = Some(idx),
                _ => {
                    feature_idx.push(idx);
                    columns.push(name.to_string());
                }
            }
        }

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let response_id = id_idx
                .and_then(|idx| record.get(idx))
                .map_or_else(|| format!("row-{}", line + 1), str::to_string);
            let values = feature_idx
                .iter()
                .zip(&columns)
                .map(|(&idx, name)| parse_optional::<f64>(record.get(idx), name))
                .collect::<Result<Vec<_>>>()?;
            let target = target_idx
                .map(|idx| parse_optional::<u8>(record.get(idx), TARGET_COLUMN))
                .transpose()?
                .flatten();
            let quality = quality_idx
                .and_then(|idx| record.get(idx))
                .map_or(QualityFlag::Ok, QualityFlag::parse);
            rows.push(FeatureRow {
                response_id,
                values,
                target,
                quality,
            });
        }
        Self::new(columns, rows)
    }
}

fn parse_optional<T: std::str::FromStr>(raw: Option<&str>, column: &str) -> Result<Option<T>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<T>()
            .map(Some)
            .map_err(|_| TurnoverError::validation(format!("column {column}: cannot parse {text:?}"))),
    }
}

/// Full feature derivation for one batch.
pub fn derive_features(responses: &[SurveyResponse]) -> FeatureTable {
    let demographics = Demographics::fit(responses);
    let mut columns: Vec<String> = FeatureVector::BASE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .collect();
    columns.extend(demographics.location_columns());

    let rows = responses
        .iter()
        .map(|response| {
            let aggregates = ResponseAggregates::from_response(response);
            let mut values = Vec::with_capacity(columns.len());
            for (_, summary) in aggregates.themes.iter() {
                values.push(summary.mean);
                values.push(summary.std);
            }
            values.push(aggregates.overall.mean);
            values.push(aggregates.overall.std);
            values.push(Some(f64::from(aggregates.red_flag_count)));
            values.push(Some(f64::from(aggregates.yellow_flag_count)));
            values.push(Some(aggregates.interaction(Theme::Manager, Theme::Reward)));
            values.push(Some(
                aggregates.interaction(Theme::WorkLifeBalance, Theme::Satisfaction),
            ));
            values.push(Some(f64::from(
                demographics.role_code(response.role.as_deref()),
            )));
            values.push(Some(f64::from(age_code(response.age_range.as_deref()))));
            values.push(demographics.tenure(response.tenure_months));
            values.extend(
                demographics
                    .location_indicators(response.location.as_deref())
                    .into_iter()
                    .map(Some),
            );
            FeatureRow {
                response_id: response.response_id.clone(),
                values,
                target: Some(response.label()),
                quality: response.quality,
            }
        })
        .collect();

    FeatureTable { columns, rows }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::FormType;

    pub(crate) fn response(id: &str, items: [Option<u8>; ITEM_COUNT]) -> SurveyResponse {
        SurveyResponse {
            response_id: id.to_string(),
            employee_id: None,
            form_type: FormType::ActiveSurvey,
            items,
            location: Some("Recife".to_string()),
            role: Some("Analyst".to_string()),
            age_range: Some("26-35".to_string()),
            tenure_months: Some(12),
            target: Some(0),
            quality: QualityFlag::Ok,
        }
    }

    fn graded_items() -> [Option<u8>; ITEM_COUNT] {
        std::array::from_fn(|i| Some((i % 5) as u8 + 1))
    }

    #[test]
    fn theme_means_stay_on_likert_scale() {
        let scores = theme_scores(&graded_items());
        for (_, summary) in scores.iter() {
            let mean = summary.mean.unwrap();
            assert!((1.0..=5.0).contains(&mean));
            assert!((mean - 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn absent_theme_is_missing_not_zero() {
        let mut items = graded_items();
        for idx in Theme::Reward.items() {
            items[idx] = None;
        }
        items[Theme::Manager.items().start] = None;
        let scores = theme_scores(&items);
        assert_eq!(scores.get(Theme::Reward), Summary::default());
        assert!(scores.get(Theme::Manager).mean.is_some());
    }

    #[test]
    fn single_item_theme_has_no_std() {
        let mut items = [None; ITEM_COUNT];
        items[0] = Some(4);
        let summary = theme_scores(&items).get(Theme::Satisfaction);
        assert_eq!(summary.mean, Some(4.0));
        assert_eq!(summary.std, None);
    }

    #[test]
    fn flag_counts_partition_items() {
        let aggregates = ResponseAggregates::from_response(&response("r", graded_items()));
        assert_eq!(aggregates.red_flag_count, 10);
        assert_eq!(aggregates.yellow_flag_count, 5);
        assert!(aggregates.red_flag_count + aggregates.yellow_flag_count <= ITEM_COUNT as u32);
    }

    #[test]
    fn interaction_with_missing_theme_is_zero() {
        let mut items = graded_items();
        for idx in Theme::Reward.items() {
            items[idx] = None;
        }
        let aggregates = ResponseAggregates::from_response(&response("r", items));
        assert_eq!(aggregates.interaction(Theme::Manager, Theme::Reward), 0.0);
        assert_eq!(
            aggregates.interaction(Theme::WorkLifeBalance, Theme::Satisfaction),
            9.0
        );
    }

    #[test]
    fn age_brackets_map_ordinally() {
        assert_eq!(age_code(Some("18-25")), 0);
        assert_eq!(age_code(Some("46-60+")), 3);
        assert_eq!(age_code(Some("61+")), 0);
        assert_eq!(age_code(None), 0);
    }

    #[test]
    fn demographics_encode_per_batch() {
        let mut a = response("a", graded_items());
        a.role = Some("Manager".to_string());
        a.location = Some("São Paulo".to_string());
        a.tenure_months = Some(10);
        let mut b = response("b", graded_items());
        b.role = Some("Analyst".to_string());
        b.location = Some("Brasília".to_string());
        b.tenure_months = Some(110);
        let mut c = response("c", graded_items());
        c.role = None;
        c.location = None;
        c.tenure_months = Some(60);

        let demographics = Demographics::fit(&[a.clone(), b, c]);
        assert_eq!(demographics.role_code(Some("Analyst")), 0);
        assert_eq!(demographics.role_code(Some("Manager")), 1);
        assert_eq!(demographics.role_code(None), -1);
        assert_eq!(demographics.location_columns(), vec!["location_são_paulo"]);
        assert_eq!(demographics.tenure(Some(10)), Some(0.0));
        let top = demographics.tenure(Some(110)).unwrap();
        assert!(top < 1.0 && top > 0.999_999);
        assert_eq!(demographics.tenure(None), None);
    }

    #[test]
    fn derivation_is_deterministic() {
        let batch = vec![response("a", graded_items()), response("b", [Some(2); ITEM_COUNT])];
        let first = derive_features(&batch);
        let second = derive_features(&batch);
        assert_eq!(first, second);
        let mut a = Vec::new();
        let mut b = Vec::new();
        first.write_csv(&mut a).unwrap();
        second.write_csv(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derived_table_starts_with_base_columns() {
        let table = derive_features(&[response("a", graded_items())]);
        assert_eq!(&table.columns()[..19], &FeatureVector::BASE_COLUMNS.map(String::from)[..]);
        assert_eq!(table.rows()[0].values.len(), table.columns().len());
    }

    #[test]
    fn align_zero_fills_missing_columns() {
        let table = derive_features(&[response("a", graded_items())]);
        let mut schema = table.columns().to_vec();
        schema.push("location_recife_norte".to_string());
        let aligned = table.align_to(&schema);
        assert_eq!(aligned.columns(), &schema[..]);
        assert_eq!(aligned.rows()[0].values.last(), Some(&Some(0.0)));
    }

    #[test]
    fn concat_unions_columns() {
        let mut a = response("a", graded_items());
        a.location = Some("Recife".to_string());
        let mut b = response("b", graded_items());
        b.location = Some("Brasília".to_string());
        let mut c = response("c", graded_items());
        c.location = Some("Recife".to_string());
        let left = derive_features(&[a]);
        let right = derive_features(&[b, c]);
        let merged = left.concat(&right);
        assert_eq!(merged.len(), 3);
        assert!(merged.column_index("location_recife").is_some());
        let idx = merged.column_index("location_recife").unwrap();
        assert_eq!(merged.rows()[0].values[idx], Some(0.0));
        assert_eq!(merged.rows()[2].values[idx], Some(1.0));
    }

    #[test]
    fn csv_round_trip_preserves_missing_values() {
        let mut items = graded_items();
        for idx in Theme::Environment.items() {
            items[idx] = None;
        }
        let table = derive_features(&[response("a", items), response("b", graded_items())]);
        let mut buffer = Vec::new();
        table.write_csv(&mut buffer).unwrap();
        let back = FeatureTable::read_csv(buffer.as_slice()).unwrap();
        assert_eq!(back.columns(), table.columns());
        let idx = back.column_index("environment_mean").unwrap();
        assert_eq!(back.rows()[0].values[idx], None);
        assert_eq!(back.rows()[1].target, Some(0));
    }
}
