use std::future::Future;
use std::io::Read;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{CareError, CareResult};
use crate::models::{Actor, Sample, User};

pub async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(settings.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Re-runs a whole transaction while it fails with a serialization conflict or deadlock.
pub async fn retry_transient<T, F, Fut>(attempts: u32, mut op: F) -> CareResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CareResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "retrying transaction after transient conflict"
                );
                attempt += 1;
            }
            result => return result,
        }
    }
}

pub async fn fetch_user(conn: &mut PgConnection, user_id: Uuid) -> CareResult<Option<User>> {
    let Some(row) =
        sqlx::query("SELECT id, full_name, email, role FROM fhr_care.users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(conn)
            .await?
    else {
        return Ok(None);
    };

    let role: String = row.try_get("role")?;
    Ok(Some(User {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        role: role.parse()?,
    }))
}

/// Stands in for the identity provider: the caller's role comes from the users table.
pub async fn resolve_actor(pool: &PgPool, user_id: Uuid) -> CareResult<Actor> {
    let mut conn = pool.acquire().await?;
    let user = fetch_user(&mut conn, user_id)
        .await?
        .ok_or_else(|| CareError::not_found("user", user_id))?;
    Ok(Actor::new(user.id, user.role))
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let users = vec![
        (
            Uuid::parse_str("6f1c2a9e-3b7d-4c55-9a41-0d2e8b7c1f01")?,
            "Amara Okafor",
            "amara.okafor@example.org",
            "patient",
        ),
        (
            Uuid::parse_str("6f1c2a9e-3b7d-4c55-9a41-0d2e8b7c1f02")?,
            "Lena Fischer",
            "lena.fischer@example.org",
            "patient",
        ),
        (
            Uuid::parse_str("b2d4e6f8-1a3c-4e5f-8b9d-2c4e6a8b0d01")?,
            "Dr. Samuel Reyes",
            "samuel.reyes@example.org",
            "doctor",
        ),
        (
            Uuid::parse_str("b2d4e6f8-1a3c-4e5f-8b9d-2c4e6a8b0d02")?,
            "Dr. Priya Natarajan",
            "priya.natarajan@example.org",
            "doctor",
        ),
        (
            Uuid::parse_str("d0c1a2b3-4e5f-4a6b-8c7d-9e0f1a2b3c01")?,
            "Clinic Admin",
            "admin@example.org",
            "admin",
        ),
    ];

    for (id, name, email, role) in &users {
        sqlx::query(
            r#"
            INSERT INTO fhr_care.users (id, full_name, email, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, role = EXCLUDED.role
            "#,
        )
        .bind(*id)
        .bind(*name)
        .bind(*email)
        .bind(*role)
        .execute(pool)
        .await?;
    }

    let assigned_at = Utc
        .with_ymd_and_hms(2026, 1, 12, 9, 30, 0)
        .single()
        .context("invalid seed timestamp")?;
    sqlx::query(
        r#"
        INSERT INTO fhr_care.doctor_patient_associations
        (doctor_id, patient_id, assigned_at, updated_at, status, note)
        VALUES ($1, $2, $3, $3, 'active', 'Routine third-trimester follow-up')
        ON CONFLICT (doctor_id, patient_id) DO NOTHING
        "#,
    )
    .bind(users[2].0)
    .bind(users[0].0)
    .bind(assigned_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Inserts a throwaway user for database-backed tests.
#[cfg(test)]
pub async fn insert_test_user(pool: &PgPool, role: crate::models::Role) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO fhr_care.users (id, full_name, email, role) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(format!("Test {role}"))
        .bind(format!("{id}@example.org"))
        .bind(role.as_str())
        .execute(pool)
        .await
        .unwrap();
    id
}

#[derive(serde::Deserialize)]
struct CsvSample {
    time_offset: f64,
    bpm: i32,
    signal_quality: Option<f64>,
}

/// Reads `time_offset,bpm,signal_quality` rows; signal_quality may be blank.
pub fn read_samples<R: Read>(reader: R) -> anyhow::Result<Vec<Sample>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut samples = Vec::new();

    for (line, result) in reader.deserialize::<CsvSample>().enumerate() {
        let row = result.with_context(|| format!("invalid sample on data row {}", line + 1))?;
        samples.push(Sample {
            time_offset: row.time_offset,
            bpm: row.bpm,
            signal_quality: row.signal_quality,
        });
    }

    Ok(samples)
}

pub fn read_samples_csv(csv_path: &std::path::Path) -> anyhow::Result<Vec<Sample>> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    read_samples(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn reads_samples_with_optional_quality() {
        let data = "time_offset,bpm,signal_quality\n0,140,0.9\n0.5,142,\n1.0,139,0.7\n";
        let samples = read_samples(data.as_bytes()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].bpm, 140);
        assert_eq!(samples[1].signal_quality, None);
        assert_eq!(samples[2].time_offset, 1.0);
    }

    #[test]
    fn malformed_sample_row_names_the_line() {
        let data = "time_offset,bpm,signal_quality\n0,140,\n1,fast,\n";
        let err = read_samples(data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("data row 2"));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Cell::new(0);
        let result = retry_transient(3, || {
            calls.set(calls.get() + 1);
            async { Ok::<_, CareError>(7) }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: CareResult<()> = retry_transient(3, || {
            calls.set(calls.get() + 1);
            async { Err(CareError::not_found("record", 1)) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), "not_found");
        assert_eq!(calls.get(), 1);
    }
}
