use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::classify::{ClassificationRequest, Classifier, FhrData, FhrPoint};
use crate::db;
use crate::error::{CareError, CareResult};
use crate::models::{Actor, MonitoringRecord, Notification, RecordSource, Role, Sample, User};
use crate::notifications;

/// Everything needed to create a monitoring record in one shot.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub source: RecordSource,
    pub samples: Vec<Sample>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Free-form label used when the engine is not run.
    pub classification: Option<String>,
    /// When present the classification engine runs at creation time.
    pub gestational_age: Option<i32>,
    pub maternal_age: Option<i32>,
}

impl NewRecord {
    /// Saturates at `i32::MAX` for sessions too long to express in minutes.
    pub fn duration_minutes(&self) -> Option<i32> {
        self.end_time.map(|end| {
            i32::try_from((end - self.start_time).num_minutes()).unwrap_or(i32::MAX)
        })
    }
}

pub fn authorize_create(new: &NewRecord, actor: &Actor) -> CareResult<()> {
    let allowed = match (actor.role, new.source) {
        (Role::Admin, _) => true,
        (Role::Patient, RecordSource::SelfReported) => actor.user_id == new.patient_id,
        (Role::Doctor, RecordSource::Clinic) => new.doctor_id == Some(actor.user_id),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(CareError::forbidden(format!(
            "{} {} may not create a {} record for patient {}",
            actor.role, actor.user_id, new.source, new.patient_id
        )))
    }
}

/// Validates and fully populates a record; classification runs here if requested.
pub fn build_record(
    new: NewRecord,
    classifier: &Classifier,
    now: DateTime<Utc>,
) -> CareResult<MonitoringRecord> {
    if new.samples.is_empty() {
        return Err(CareError::invalid("a monitoring record needs at least one sample"));
    }
    if new
        .samples
        .windows(2)
        .any(|pair| pair[1].time_offset < pair[0].time_offset)
    {
        return Err(CareError::invalid("sample time offsets must be non-decreasing"));
    }
    if new.end_time.is_some_and(|end| end < new.start_time) {
        return Err(CareError::invalid("end_time must not be before start_time"));
    }
    match (new.source, new.doctor_id) {
        (RecordSource::Clinic, None) => {
            return Err(CareError::invalid("clinic records must name the performing doctor"))
        }
        (RecordSource::SelfReported, Some(_)) => {
            return Err(CareError::invalid(
                "self records carry no performing doctor; share the record instead",
            ))
        }
        _ => {}
    }

    let result = match new.gestational_age {
        Some(gestational_age) => {
            let request = ClassificationRequest {
                fhr_data: FhrData::Points(
                    new.samples
                        .iter()
                        .map(|s| FhrPoint {
                            bpm: s.bpm,
                            timestamp: Some(serde_json::json!(s.time_offset)),
                            signal_quality: s.signal_quality,
                        })
                        .collect(),
                ),
                gestational_age,
                maternal_age: new.maternal_age,
                duration_minutes: new.duration_minutes(),
            };
            Some(classifier.classify_request(&request)?)
        }
        None => None,
    };

    let classification = match &result {
        Some(result) => result.primary_classification.as_str().to_string(),
        None => new.classification.clone().unwrap_or_default(),
    };

    Ok(MonitoringRecord {
        id: Uuid::new_v4(),
        patient_id: new.patient_id,
        doctor_id: new.doctor_id,
        source: new.source,
        samples: new.samples,
        start_time: new.start_time,
        end_time: new.end_time,
        classification,
        result,
        notes: new.notes.unwrap_or_default(),
        shared_with: None,
        created_at: now,
    })
}

/// Ownership first, then the target doctor. A user without the doctor role
/// is reported the same as a missing doctor.
pub fn authorize_share(
    record: &MonitoringRecord,
    patient_id: Uuid,
    doctor: Option<&User>,
    doctor_id: Uuid,
) -> CareResult<()> {
    if record.patient_id != patient_id {
        return Err(CareError::forbidden(format!(
            "record {} does not belong to patient {patient_id}",
            record.id
        )));
    }
    match doctor {
        Some(user) if user.role == Role::Doctor => Ok(()),
        _ => Err(CareError::not_found("doctor", doctor_id)),
    }
}

pub fn can_view(record: &MonitoringRecord, actor: &Actor) -> bool {
    actor.is_admin()
        || record.patient_id == actor.user_id
        || record.doctor_id == Some(actor.user_id)
        || record.shared_with == Some(actor.user_id)
}

pub async fn create_record(
    pool: &PgPool,
    new: NewRecord,
    actor: &Actor,
    classifier: &Classifier,
) -> CareResult<MonitoringRecord> {
    authorize_create(&new, actor)?;
    let record = build_record(new, classifier, Utc::now())?;

    let mut tx = pool.begin().await?;
    require_role(&mut tx, record.patient_id, Role::Patient, "patient").await?;
    if let Some(doctor_id) = record.doctor_id {
        require_role(&mut tx, doctor_id, Role::Doctor, "doctor").await?;
    }
    insert_record(&mut tx, &record).await?;
    tx.commit().await?;

    tracing::info!(
        record_id = %record.id,
        patient_id = %record.patient_id,
        source = %record.source,
        classification = %record.classification,
        "monitoring record created"
    );
    Ok(record)
}

pub async fn share(
    pool: &PgPool,
    attempts: u32,
    record_id: Uuid,
    patient_id: Uuid,
    doctor_id: Uuid,
    note: Option<String>,
) -> CareResult<Notification> {
    db::retry_transient(attempts, || {
        share_once(pool, record_id, patient_id, doctor_id, note.clone())
    })
    .await
}

async fn share_once(
    pool: &PgPool,
    record_id: Uuid,
    patient_id: Uuid,
    doctor_id: Uuid,
    note: Option<String>,
) -> CareResult<Notification> {
    let mut tx = pool.begin().await?;

    let mut record = fetch_record(&mut tx, record_id, true)
        .await?
        .ok_or_else(|| CareError::not_found("record", record_id))?;
    let doctor = db::fetch_user(&mut tx, doctor_id).await?;
    authorize_share(&record, patient_id, doctor.as_ref(), doctor_id)?;
    let patient = db::fetch_user(&mut tx, patient_id)
        .await?
        .ok_or_else(|| CareError::not_found("patient", patient_id))?;

    record.shared_with = Some(doctor_id);
    if let Some(note) = note {
        record.notes = note;
    }
    sqlx::query(
        "UPDATE fhr_care.monitoring_records SET shared_with = $2, notes = $3 WHERE id = $1",
    )
    .bind(record.id)
    .bind(doctor_id)
    .bind(&record.notes)
    .execute(&mut *tx)
    .await?;

    let notification = notifications::notify(&mut tx, &patient, doctor_id, &record).await?;
    tx.commit().await?;

    tracing::info!(
        record_id = %record_id,
        patient_id = %patient_id,
        doctor_id = %doctor_id,
        notification_id = %notification.id,
        "record shared"
    );
    Ok(notification)
}

pub async fn get_record(
    pool: &PgPool,
    record_id: Uuid,
    actor: &Actor,
) -> CareResult<MonitoringRecord> {
    let mut conn = pool.acquire().await?;
    let record = fetch_record(&mut conn, record_id, false)
        .await?
        .ok_or_else(|| CareError::not_found("record", record_id))?;
    if !can_view(&record, actor) {
        return Err(CareError::forbidden(format!(
            "{} {} may not view record {record_id}",
            actor.role, actor.user_id
        )));
    }
    Ok(record)
}

async fn require_role(
    conn: &mut PgConnection,
    user_id: Uuid,
    role: Role,
    entity: &'static str,
) -> CareResult<User> {
    match db::fetch_user(conn, user_id).await? {
        Some(user) if user.role == role => Ok(user),
        _ => Err(CareError::not_found(entity, user_id)),
    }
}

async fn insert_record(conn: &mut PgConnection, record: &MonitoringRecord) -> CareResult<()> {
    sqlx::query(
        r#"
        INSERT INTO fhr_care.monitoring_records
        (id, patient_id, doctor_id, source, samples, start_time, end_time,
         classification, result, notes, shared_with, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.id)
    .bind(record.patient_id)
    .bind(record.doctor_id)
    .bind(record.source.as_str())
    .bind(Json(&record.samples))
    .bind(record.start_time)
    .bind(record.end_time)
    .bind(&record.classification)
    .bind(record.result.as_ref().map(Json))
    .bind(&record.notes)
    .bind(record.shared_with)
    .bind(record.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn fetch_record(
    conn: &mut PgConnection,
    record_id: Uuid,
    for_update: bool,
) -> CareResult<Option<MonitoringRecord>> {
    let mut query = String::from(
        "SELECT id, patient_id, doctor_id, source, samples, start_time, end_time, \
         classification, result, notes, shared_with, created_at \
         FROM fhr_care.monitoring_records WHERE id = $1",
    );
    if for_update {
        query.push_str(" FOR UPDATE");
    }

    let Some(row) = sqlx::query(&query)
        .bind(record_id)
        .fetch_optional(conn)
        .await?
    else {
        return Ok(None);
    };

    let source: String = row.try_get("source")?;
    let samples: Json<Vec<Sample>> = row.try_get("samples")?;
    let result: Option<Json<crate::models::ClassificationResult>> = row.try_get("result")?;

    Ok(Some(MonitoringRecord {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        doctor_id: row.try_get("doctor_id")?,
        source: source.parse()?,
        samples: samples.0,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        classification: row.try_get("classification")?,
        result: result.map(|json| json.0),
        notes: row.try_get("notes")?,
        shared_with: row.try_get("shared_with")?,
        created_at: row.try_get("created_at")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::models::PrimaryClassification;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap()
    }

    fn samples(bpm: &[i32]) -> Vec<Sample> {
        bpm.iter()
            .enumerate()
            .map(|(i, &bpm)| Sample {
                time_offset: i as f64,
                bpm,
                signal_quality: None,
            })
            .collect()
    }

    fn home_record(patient_id: Uuid) -> NewRecord {
        NewRecord {
            patient_id,
            doctor_id: None,
            source: RecordSource::SelfReported,
            samples: samples(&[140, 142, 138, 141]),
            start_time: start(),
            end_time: Some(start() + Duration::minutes(30)),
            notes: Some("evening check".into()),
            classification: None,
            gestational_age: Some(30),
            maternal_age: None,
        }
    }

    fn user(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            full_name: "Dana Whitfield".into(),
            email: "dana@example.com".into(),
            role,
        }
    }

    #[test]
    fn builds_classified_home_record() {
        let patient = Uuid::new_v4();
        let record = build_record(home_record(patient), &Classifier::default(), start()).unwrap();
        assert_eq!(record.patient_id, patient);
        assert_eq!(record.classification, "normal");
        let result = record.result.unwrap();
        assert_eq!(result.primary_classification, PrimaryClassification::Normal);
        assert_eq!(record.notes, "evening check");
        assert!(record.shared_with.is_none());
    }

    #[test]
    fn keeps_free_form_label_without_engine() {
        let mut new = home_record(Uuid::new_v4());
        new.gestational_age = None;
        new.classification = Some("reassuring".into());
        let record = build_record(new, &Classifier::default(), start()).unwrap();
        assert_eq!(record.classification, "reassuring");
        assert!(record.result.is_none());
    }

    #[test]
    fn overlong_session_duration_saturates() {
        let mut new = home_record(Uuid::new_v4());
        new.end_time = Some(start() + Duration::minutes(i64::from(i32::MAX) + 10));
        assert_eq!(new.duration_minutes(), Some(i32::MAX));

        let record = build_record(new, &Classifier::default(), start()).unwrap();
        let result = record.result.unwrap();
        assert!(!result.findings.iter().any(|f| f.contains("shorter than 20 minutes")));
    }

    #[test]
    fn rejects_end_before_start() {
        let mut new = home_record(Uuid::new_v4());
        new.end_time = Some(start() - Duration::minutes(1));
        let err = build_record(new, &Classifier::default(), start()).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn rejects_unordered_or_empty_samples() {
        let mut new = home_record(Uuid::new_v4());
        new.samples.swap(0, 2);
        assert!(build_record(new, &Classifier::default(), start()).is_err());

        let mut empty = home_record(Uuid::new_v4());
        empty.samples.clear();
        assert!(build_record(empty, &Classifier::default(), start()).is_err());
    }

    #[test]
    fn enforces_source_semantics() {
        let mut clinic = home_record(Uuid::new_v4());
        clinic.source = RecordSource::Clinic;
        assert!(build_record(clinic.clone(), &Classifier::default(), start()).is_err());
        clinic.doctor_id = Some(Uuid::new_v4());
        assert!(build_record(clinic, &Classifier::default(), start()).is_ok());

        let mut home = home_record(Uuid::new_v4());
        home.doctor_id = Some(Uuid::new_v4());
        assert!(build_record(home, &Classifier::default(), start()).is_err());
    }

    #[test]
    fn bad_gestational_age_fails_creation() {
        let mut new = home_record(Uuid::new_v4());
        new.gestational_age = Some(50);
        assert!(build_record(new, &Classifier::default(), start()).is_err());
    }

    #[test]
    fn only_owner_or_performer_may_create() {
        let patient = Uuid::new_v4();
        let new = home_record(patient);
        assert!(authorize_create(&new, &Actor::new(patient, Role::Patient)).is_ok());
        assert!(authorize_create(&new, &Actor::new(Uuid::new_v4(), Role::Patient)).is_err());
        assert!(authorize_create(&new, &Actor::new(Uuid::new_v4(), Role::Doctor)).is_err());
        assert!(authorize_create(&new, &Actor::new(Uuid::new_v4(), Role::Admin)).is_ok());

        let doctor = Uuid::new_v4();
        let mut clinic = home_record(patient);
        clinic.source = RecordSource::Clinic;
        clinic.doctor_id = Some(doctor);
        assert!(authorize_create(&clinic, &Actor::new(doctor, Role::Doctor)).is_ok());
        assert!(authorize_create(&clinic, &Actor::new(patient, Role::Patient)).is_err());
    }

    #[test]
    fn share_checks_owner_then_doctor() {
        let patient = Uuid::new_v4();
        let record = build_record(home_record(patient), &Classifier::default(), start()).unwrap();
        let doctor = user(Role::Doctor);

        assert!(authorize_share(&record, patient, Some(&doctor), doctor.id).is_ok());

        let stranger = authorize_share(&record, Uuid::new_v4(), Some(&doctor), doctor.id);
        assert_eq!(stranger.unwrap_err().kind(), "forbidden");

        let missing = authorize_share(&record, patient, None, Uuid::new_v4());
        assert_eq!(missing.unwrap_err().kind(), "not_found");

        let not_a_doctor = user(Role::Patient);
        let wrong_role = authorize_share(&record, patient, Some(&not_a_doctor), not_a_doctor.id);
        assert_eq!(wrong_role.unwrap_err().kind(), "not_found");
    }

    #[test]
    fn shared_doctor_can_view() {
        let patient = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        let mut record =
            build_record(home_record(patient), &Classifier::default(), start()).unwrap();
        assert!(!can_view(&record, &Actor::new(doctor, Role::Doctor)));
        record.shared_with = Some(doctor);
        assert!(can_view(&record, &Actor::new(doctor, Role::Doctor)));
        assert!(can_view(&record, &Actor::new(patient, Role::Patient)));
    }

    async fn notification_count(pool: &PgPool, record_id: Uuid) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM fhr_care.notifications WHERE record_id = $1")
            .bind(record_id)
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn rejected_share_leaves_no_trace(pool: PgPool) {
        let patient = Actor::new(db::insert_test_user(&pool, Role::Patient).await, Role::Patient);
        let other_patient = db::insert_test_user(&pool, Role::Patient).await;
        let doctor = db::insert_test_user(&pool, Role::Doctor).await;
        let record = create_record(
            &pool,
            home_record(patient.user_id),
            &patient,
            &Classifier::default(),
        )
        .await
        .unwrap();

        let err = share(&pool, 3, record.id, other_patient, doctor, Some("look".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        let err = share(&pool, 3, record.id, patient.user_id, other_patient, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        assert_eq!(notification_count(&pool, record.id).await, 0);
        let stored = get_record(&pool, record.id, &patient).await.unwrap();
        assert_eq!(stored.shared_with, None);
        assert_eq!(stored.notes, "evening check");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn share_updates_record_and_notifies_each_time(pool: PgPool) {
        let patient = Actor::new(db::insert_test_user(&pool, Role::Patient).await, Role::Patient);
        let doctor = db::insert_test_user(&pool, Role::Doctor).await;
        let record = create_record(
            &pool,
            home_record(patient.user_id),
            &patient,
            &Classifier::default(),
        )
        .await
        .unwrap();

        let note = Some("please review".to_string());
        let first = share(&pool, 3, record.id, patient.user_id, doctor, note)
            .await
            .unwrap();
        let second = share(&pool, 3, record.id, patient.user_id, doctor, None)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(notification_count(&pool, record.id).await, 2);

        let viewer = Actor::new(doctor, Role::Doctor);
        let stored = get_record(&pool, record.id, &viewer).await.unwrap();
        assert_eq!(stored.shared_with, Some(doctor));
        assert_eq!(stored.notes, "please review");
    }
}
