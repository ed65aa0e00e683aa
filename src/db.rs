use anyhow::{bail, Context};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::features::{FeatureRow, FeatureTable};
use crate::models::{FormType, QualityFlag, SurveyResponse, ITEM_COUNT};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Upserts raw responses; returns how many rows were written.
pub async fn insert_responses(pool: &PgPool, responses: &[SurveyResponse]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    let mut written = 0usize;

    for response in responses {
        let items: Vec<Option<i16>> = response.items.iter().map(|v| v.map(i16::from)).collect();
        let tenure = response
            .tenure_months
            .map(i32::try_from)
            .transpose()
            .with_context(|| format!("tenure out of range for {}", response.response_id))?;

        let result = sqlx::query(
            r#"
            INSERT INTO turnover_risk.raw_responses
            (response_id, employee_id, form_type, items, location, role, age_range,
             tenure_months, target, data_quality_flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (response_id) DO UPDATE
            SET employee_id = EXCLUDED.employee_id,
                form_type = EXCLUDED.form_type,
                items = EXCLUDED.items,
                location = EXCLUDED.location,
                role = EXCLUDED.role,
                age_range = EXCLUDED.age_range,
                tenure_months = EXCLUDED.tenure_months,
                target = EXCLUDED.target,
                data_quality_flag = EXCLUDED.data_quality_flag
            "#,
        )
        .bind(&response.response_id)
        .bind(&response.employee_id)
        .bind(response.form_type.as_str())
        .bind(items)
        .bind(&response.location)
        .bind(&response.role)
        .bind(&response.age_range)
        .bind(tenure)
        .bind(response.target.map(i16::from))
        .bind(response.quality.as_str())
        .execute(&mut *tx)
        .await?;

        written += result.rows_affected() as usize;
    }

    tx.commit().await?;
    Ok(written)
}

pub async fn fetch_responses(pool: &PgPool) -> anyhow::Result<Vec<SurveyResponse>> {
    let records = sqlx::query(
        "SELECT response_id, employee_id, form_type, items, location, role, age_range, \
         tenure_months, target, data_quality_flag \
         FROM turnover_risk.raw_responses \
         ORDER BY created_at, response_id",
    )
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(records.len());
    for row in records {
        let response_id: String = row.get("response_id");
        let form_type: String = row.get("form_type");
        let form_type = FormType::parse(&form_type)
            .with_context(|| format!("unknown form type {form_type:?} for {response_id}"))?;

        let stored: Vec<Option<i16>> = row.get("items");
        if stored.len() != ITEM_COUNT {
            bail!("response {response_id} has {} items", stored.len());
        }
        let mut items = [None; ITEM_COUNT];
        for (slot, value) in items.iter_mut().zip(stored) {
            *slot = value
                .map(u8::try_from)
                .transpose()
                .with_context(|| format!("item out of range for {response_id}"))?;
        }

        let tenure: Option<i32> = row.get("tenure_months");
        let target: Option<i16> = row.get("target");
        let quality: String = row.get("data_quality_flag");
        responses.push(SurveyResponse {
            employee_id: row.get("employee_id"),
            form_type,
            items,
            location: row.get("location"),
            role: row.get("role"),
            age_range: row.get("age_range"),
            tenure_months: tenure.map(u32::try_from).transpose()?,
            target: target.map(u8::try_from).transpose()?,
            quality: QualityFlag::parse(&quality),
            response_id,
        });
    }

    Ok(responses)
}

/// Stores one transform run and returns its id.
pub async fn save_features(pool: &PgPool, table: &FeatureTable) -> anyhow::Result<Uuid> {
    let run_id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    for row in table.rows() {
        sqlx::query(
            r#"
            INSERT INTO turnover_risk.processed_features
            (run_id, response_id, columns, feature_values, target, data_quality_flag)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(&row.response_id)
        .bind(table.columns())
        .bind(&row.values)
        .bind(row.target.map(i16::from))
        .bind(row.quality.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(run_id)
}

/// Loads one transform run, the most recent when `run_id` is `None`.
pub async fn fetch_features(pool: &PgPool, run_id: Option<Uuid>) -> anyhow::Result<FeatureTable> {
    let run_id = match run_id {
        Some(id) => id,
        None => sqlx::query(
            "SELECT run_id FROM turnover_risk.processed_features \
             ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?
        .map(|row| row.get::<Uuid, _>("run_id"))
        .context("no processed features stored; run `transform` first")?,
    };

    let records = sqlx::query(
        "SELECT response_id, columns, feature_values, target, data_quality_flag \
         FROM turnover_risk.processed_features \
         WHERE run_id = $1 \
         ORDER BY response_id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    // rows of one run normally share a column list; differing lists are unioned
    let mut groups: Vec<(Vec<String>, Vec<FeatureRow>)> = Vec::new();
    for row in records {
        let columns: Vec<String> = row.get("columns");
        let target: Option<i16> = row.get("target");
        let quality: String = row.get("data_quality_flag");
        let feature_row = FeatureRow {
            response_id: row.get("response_id"),
            values: row.get("feature_values"),
            target: target.map(u8::try_from).transpose()?,
            quality: QualityFlag::parse(&quality),
        };
        match groups.iter_mut().find(|(existing, _)| *existing == columns) {
            Some((_, rows)) => rows.push(feature_row),
            None => groups.push((columns, vec![feature_row])),
        }
    }

    let mut table: Option<FeatureTable> = None;
    for (columns, rows) in groups {
        let group = FeatureTable::new(columns, rows)?;
        table = Some(match table {
            Some(acc) => acc.concat(&group),
            None => group,
        });
    }

    table.with_context(|| format!("transform run {run_id} has no rows"))
}
