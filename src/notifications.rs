use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::db;
use crate::error::{CareError, CareResult};
use crate::models::{MonitoringRecord, Notification, NotificationStatus, User};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationItem {
    pub id: Uuid,
    pub from_patient_name: String,
    pub record_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationList {
    pub notifications: Vec<NotificationItem>,
    pub unread_count: usize,
}

impl Notification {
    pub fn compose(
        from_patient: &User,
        to_doctor: Uuid,
        record: &MonitoringRecord,
        now: DateTime<Utc>,
    ) -> Self {
        let label = if record.classification.is_empty() {
            "unclassified".to_string()
        } else {
            record.classification.clone()
        };
        Self {
            id: Uuid::new_v4(),
            from_patient: from_patient.id,
            to_doctor,
            record_id: record.id,
            message: format!(
                "{} shared a monitoring record from {} ({label})",
                from_patient.full_name,
                record.start_time.format("%Y-%m-%d %H:%M UTC")
            ),
            status: NotificationStatus::Unread,
            created_at: now,
            read_at: None,
        }
    }

    /// One-way unread -> read. Returns whether anything changed.
    pub fn mark_read(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            NotificationStatus::Unread => {
                self.status = NotificationStatus::Read;
                self.read_at = Some(now);
                true
            }
            NotificationStatus::Read => false,
        }
    }
}

pub fn build_inbox(mut rows: Vec<(Notification, String)>) -> NotificationList {
    rows.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
    let notifications: Vec<NotificationItem> = rows
        .into_iter()
        .map(|(notification, patient_name)| NotificationItem {
            id: notification.id,
            from_patient_name: patient_name,
            record_id: notification.record_id,
            message: notification.message,
            created_at: notification.created_at,
            is_read: notification.status == NotificationStatus::Read,
        })
        .collect();
    let unread_count = notifications.iter().filter(|n| !n.is_read).count();
    NotificationList {
        notifications,
        unread_count,
    }
}

/// Runs inside the caller's sharing transaction. Repeated shares each get their own row.
pub async fn notify(
    conn: &mut PgConnection,
    from_patient: &User,
    to_doctor: Uuid,
    record: &MonitoringRecord,
) -> CareResult<Notification> {
    let notification = Notification::compose(from_patient, to_doctor, record, Utc::now());
    sqlx::query(
        r#"
        INSERT INTO fhr_care.notifications
        (id, from_patient, to_doctor, record_id, message, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(notification.id)
    .bind(notification.from_patient)
    .bind(notification.to_doctor)
    .bind(notification.record_id)
    .bind(&notification.message)
    .bind(notification.status.as_str())
    .bind(notification.created_at)
    .execute(conn)
    .await?;
    Ok(notification)
}

pub async fn mark_read(
    pool: &PgPool,
    attempts: u32,
    notification_id: Uuid,
    doctor_id: Uuid,
) -> CareResult<Notification> {
    db::retry_transient(attempts, || mark_read_once(pool, notification_id, doctor_id)).await
}

async fn mark_read_once(
    pool: &PgPool,
    notification_id: Uuid,
    doctor_id: Uuid,
) -> CareResult<Notification> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "SELECT id, from_patient, to_doctor, record_id, message, status, created_at, read_at \
         FROM fhr_care.notifications WHERE id = $1 AND to_doctor = $2 FOR UPDATE",
    )
    .bind(notification_id)
    .bind(doctor_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| CareError::not_found("notification", notification_id))?;

    let mut notification = notification_from_row(&row)?;
    if notification.mark_read(Utc::now()) {
        sqlx::query("UPDATE fhr_care.notifications SET status = $2, read_at = $3 WHERE id = $1")
            .bind(notification.id)
            .bind(notification.status.as_str())
            .bind(notification.read_at)
            .execute(&mut *tx)
            .await?;
        tracing::info!(
            notification_id = %notification_id,
            doctor_id = %doctor_id,
            "notification read"
        );
    }
    tx.commit().await?;
    Ok(notification)
}

pub async fn list_notifications(pool: &PgPool, doctor_id: Uuid) -> CareResult<NotificationList> {
    let rows = sqlx::query(
        "SELECT n.id, n.from_patient, n.to_doctor, n.record_id, n.message, n.status, \
         n.created_at, n.read_at, u.full_name AS from_patient_name \
         FROM fhr_care.notifications n \
         JOIN fhr_care.users u ON u.id = n.from_patient \
         WHERE n.to_doctor = $1",
    )
    .bind(doctor_id)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("from_patient_name")?;
        entries.push((notification_from_row(&row)?, name));
    }
    Ok(build_inbox(entries))
}

fn notification_from_row(row: &sqlx::postgres::PgRow) -> CareResult<Notification> {
    let status: String = row.try_get("status")?;
    Ok(Notification {
        id: row.try_get("id")?,
        from_patient: row.try_get("from_patient")?,
        to_doctor: row.try_get("to_doctor")?,
        record_id: row.try_get("record_id")?,
        message: row.try_get("message")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}
