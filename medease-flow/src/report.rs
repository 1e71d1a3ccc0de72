use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

/// Who a persisted simplification belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOwner {
    pub user_id: String,
    pub report_id: String,
    pub user_email: String,
}

/// Persisted outcome of a simplification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalReport {
    pub user_id: String,
    pub report_id: String,
    pub user_email: String,
    pub original_report: String,
    pub simplified_report: String,
    pub formatted_simplified_report: String,
    pub date_created: DateTime<Utc>,
}

/// Write side of report persistence, plus a per-user listing
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn save(&self, report: MedicalReport) -> Result<()>;
    /// Reports of one user, newest first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicalReport>>;
}

/// In-memory implementation of ReportStore. Report ids are chosen by clients, so they are
/// only unique per user.
pub struct InMemoryReportStore {
    reports: Arc<DashMap<(String, String), MedicalReport>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

impl Default for InMemoryReportStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn save(&self, report: MedicalReport) -> Result<()> {
        let key = (report.user_id.clone(), report.report_id.clone());
        self.reports.insert(key, report);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicalReport>> {
        let mut reports: Vec<MedicalReport> = self
            .reports
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        reports.sort_by(|a, b| b.date_created.cmp(&a.date_created));
        Ok(reports)
    }
}

/// Postgres implementation of ReportStore
pub struct PostgresReportStore {
    pool: PgPool,
}

impl PostgresReportStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS medical_reports (
                user_id TEXT NOT NULL,
                report_id TEXT NOT NULL,
                user_email TEXT NOT NULL,
                original_report TEXT NOT NULL,
                simplified_report TEXT NOT NULL,
                formatted_simplified_report TEXT NOT NULL,
                date_created TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, report_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("medical_reports table ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ReportStore for PostgresReportStore {
    async fn save(&self, report: MedicalReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO medical_reports
                (report_id, user_id, user_email, original_report, simplified_report,
                 formatted_simplified_report, date_created)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, report_id) DO UPDATE SET
                user_email = EXCLUDED.user_email,
                original_report = EXCLUDED.original_report,
                simplified_report = EXCLUDED.simplified_report,
                formatted_simplified_report = EXCLUDED.formatted_simplified_report,
                date_created = EXCLUDED.date_created
            "#,
        )
        .bind(&report.report_id)
        .bind(&report.user_id)
        .bind(&report.user_email)
        .bind(&report.original_report)
        .bind(&report.simplified_report)
        .bind(&report.formatted_simplified_report)
        .bind(report.date_created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<MedicalReport>> {
        let rows = sqlx::query(
            r#"
            SELECT report_id, user_id, user_email, original_report, simplified_report,
                   formatted_simplified_report, date_created
            FROM medical_reports
            WHERE user_id = $1
            ORDER BY date_created DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<MedicalReport> {
                Ok(MedicalReport {
                    report_id: row.try_get("report_id")?,
                    user_id: row.try_get("user_id")?,
                    user_email: row.try_get("user_email")?,
                    original_report: row.try_get("original_report")?,
                    simplified_report: row.try_get("simplified_report")?,
                    formatted_simplified_report: row.try_get("formatted_simplified_report")?,
                    date_created: row.try_get("date_created")?,
                })
            })
            .collect()
    }
}
