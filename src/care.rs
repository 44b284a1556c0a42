use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::db;
use crate::error::{is_unique_violation, CareError, CareResult};
use crate::models::{Actor, CareStatus, DoctorPatientAssociation, PatientStatusHistory, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: CareStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdateResponse {
    pub message: String,
    pub association: DoctorPatientAssociation,
}

/// Result of planning a status update: the next association row and, when
/// status or notes changed, the audit row to append alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub association: DoctorPatientAssociation,
    pub history: Option<PatientStatusHistory>,
}

/// Only the assigned doctor or an admin may act on an association.
pub fn authorize(actor: &Actor, doctor_id: Uuid) -> CareResult<()> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Doctor if actor.user_id == doctor_id => Ok(()),
        _ => Err(CareError::forbidden(format!(
            "{} {} cannot manage patients assigned to doctor {doctor_id}",
            actor.role, actor.user_id
        ))),
    }
}

pub fn check_transition(from: CareStatus, to: CareStatus) -> CareResult<()> {
    match (from, to) {
        (CareStatus::Discharged, CareStatus::Discharged) => Ok(()),
        (CareStatus::Discharged, to) => Err(CareError::InvalidStateTransition { from, to }),
        (CareStatus::Active | CareStatus::Inactive, _) => Ok(()),
    }
}

pub fn new_association(
    doctor_id: Uuid,
    patient_id: Uuid,
    status: Option<CareStatus>,
    note: Option<String>,
    now: DateTime<Utc>,
) -> DoctorPatientAssociation {
    DoctorPatientAssociation {
        doctor_id,
        patient_id,
        assigned_at: now,
        updated_at: now,
        status: status.unwrap_or(CareStatus::Active),
        note,
        status_updated_at: None,
        status_updated_by: None,
        version: 0,
    }
}

pub fn plan_status_update(
    current: &DoctorPatientAssociation,
    update: &StatusUpdate,
    actor: &Actor,
    now: DateTime<Utc>,
) -> CareResult<Transition> {
    authorize(actor, current.doctor_id)?;
    check_transition(current.status, update.status)?;

    let status_changed = current.status != update.status;
    let notes_changed = update
        .notes
        .as_ref()
        .is_some_and(|notes| current.note.as_ref() != Some(notes));

    let mut next = current.clone();
    next.updated_at = now;
    next.version += 1;

    if !status_changed && !notes_changed {
        return Ok(Transition {
            association: next,
            history: None,
        });
    }

    next.status = update.status;
    if notes_changed {
        next.note = update.notes.clone();
    }
    next.status_updated_at = Some(now);
    next.status_updated_by = Some(actor.user_id);

    let history = PatientStatusHistory {
        id: Uuid::new_v4(),
        doctor_id: current.doctor_id,
        patient_id: current.patient_id,
        old_status: current.status,
        new_status: update.status,
        notes: update.notes.clone(),
        changed_by: actor.user_id,
        changed_at: now,
    };

    Ok(Transition {
        association: next,
        history: Some(history),
    })
}

pub async fn assign(
    pool: &PgPool,
    doctor_id: Uuid,
    patient_id: Uuid,
    status: Option<CareStatus>,
    note: Option<String>,
    actor: &Actor,
) -> CareResult<DoctorPatientAssociation> {
    authorize(actor, doctor_id)?;
    let association = new_association(doctor_id, patient_id, status, note, Utc::now());

    let mut tx = pool.begin().await?;
    let parties = [
        (doctor_id, Role::Doctor, "doctor"),
        (patient_id, Role::Patient, "patient"),
    ];
    for (user_id, role, entity) in parties {
        match db::fetch_user(&mut tx, user_id).await? {
            Some(user) if user.role == role => {}
            _ => return Err(CareError::not_found(entity, user_id)),
        }
    }
    if fetch_association(&mut tx, doctor_id, patient_id, false).await?.is_some() {
        return Err(CareError::AlreadyAssigned { doctor_id, patient_id });
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO fhr_care.doctor_patient_associations
        (doctor_id, patient_id, assigned_at, updated_at, status, note, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(association.doctor_id)
    .bind(association.patient_id)
    .bind(association.assigned_at)
    .bind(association.updated_at)
    .bind(association.status.as_str())
    .bind(&association.note)
    .bind(association.version)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => {
            return Err(CareError::AlreadyAssigned { doctor_id, patient_id })
        }
        Err(err) => return Err(err.into()),
    }
    tx.commit().await?;

    tracing::info!(
        doctor_id = %doctor_id,
        patient_id = %patient_id,
        status = %association.status,
        "patient assigned"
    );
    Ok(association)
}

/// Hard delete. Status history for the pair is left in place.
pub async fn unassign(
    pool: &PgPool,
    doctor_id: Uuid,
    patient_id: Uuid,
    actor: &Actor,
) -> CareResult<()> {
    authorize(actor, doctor_id)?;
    let deleted = sqlx::query(
        "DELETE FROM fhr_care.doctor_patient_associations WHERE doctor_id = $1 AND patient_id = $2",
    )
    .bind(doctor_id)
    .bind(patient_id)
    .execute(pool)
    .await?;

    if deleted.rows_affected() == 0 {
        return Err(CareError::not_found("association", format!("{doctor_id}/{patient_id}")));
    }
    tracing::info!(doctor_id = %doctor_id, patient_id = %patient_id, "patient unassigned");
    Ok(())
}

pub async fn update_status(
    pool: &PgPool,
    attempts: u32,
    doctor_id: Uuid,
    patient_id: Uuid,
    update: StatusUpdate,
    actor: &Actor,
) -> CareResult<StatusUpdateResponse> {
    db::retry_transient(attempts, || {
        update_status_once(pool, doctor_id, patient_id, &update, actor)
    })
    .await
}

async fn update_status_once(
    pool: &PgPool,
    doctor_id: Uuid,
    patient_id: Uuid,
    update: &StatusUpdate,
    actor: &Actor,
) -> CareResult<StatusUpdateResponse> {
    let mut tx = pool.begin().await?;

    // Row lock serializes concurrent updates on the same pair.
    let current = fetch_association(&mut tx, doctor_id, patient_id, true)
        .await?
        .ok_or_else(|| CareError::not_found("association", format!("{doctor_id}/{patient_id}")))?;

    let transition = plan_status_update(&current, update, actor, Utc::now())?;
    let next = &transition.association;

    let updated = sqlx::query(
        r#"
        UPDATE fhr_care.doctor_patient_associations
        SET status = $3, note = $4, updated_at = $5, status_updated_at = $6,
            status_updated_by = $7, version = $8
        WHERE doctor_id = $1 AND patient_id = $2 AND version = $9
        "#,
    )
    .bind(doctor_id)
    .bind(patient_id)
    .bind(next.status.as_str())
    .bind(&next.note)
    .bind(next.updated_at)
    .bind(next.status_updated_at)
    .bind(next.status_updated_by)
    .bind(next.version)
    .bind(current.version)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CareError::not_found("association", format!("{doctor_id}/{patient_id}")));
    }

    if let Some(history) = &transition.history {
        sqlx::query(
            r#"
            INSERT INTO fhr_care.patient_status_history
            (id, doctor_id, patient_id, old_status, new_status, notes, changed_by, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(history.id)
        .bind(history.doctor_id)
        .bind(history.patient_id)
        .bind(history.old_status.as_str())
        .bind(history.new_status.as_str())
        .bind(&history.notes)
        .bind(history.changed_by)
        .bind(history.changed_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let message = match &transition.history {
        Some(history) if history.old_status != history.new_status => {
            format!("Patient status updated to {}", history.new_status)
        }
        Some(_) => "Patient status notes updated".to_string(),
        None => "No changes to patient status".to_string(),
    };
    tracing::info!(
        doctor_id = %doctor_id,
        patient_id = %patient_id,
        status = %next.status,
        audited = transition.history.is_some(),
        "patient status update applied"
    );

    Ok(StatusUpdateResponse {
        message,
        association: transition.association,
    })
}

pub async fn history(
    pool: &PgPool,
    doctor_id: Uuid,
    patient_id: Uuid,
    actor: &Actor,
) -> CareResult<Vec<PatientStatusHistory>> {
    authorize(actor, doctor_id)?;
    let rows = sqlx::query(
        "SELECT id, doctor_id, patient_id, old_status, new_status, notes, changed_by, changed_at \
         FROM fhr_care.patient_status_history \
         WHERE doctor_id = $1 AND patient_id = $2 \
         ORDER BY changed_at, id",
    )
    .bind(doctor_id)
    .bind(patient_id)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let old_status: String = row.try_get("old_status")?;
        let new_status: String = row.try_get("new_status")?;
        entries.push(PatientStatusHistory {
            id: row.try_get("id")?,
            doctor_id: row.try_get("doctor_id")?,
            patient_id: row.try_get("patient_id")?,
            old_status: old_status.parse()?,
            new_status: new_status.parse()?,
            notes: row.try_get("notes")?,
            changed_by: row.try_get("changed_by")?,
            changed_at: row.try_get("changed_at")?,
        });
    }
    Ok(entries)
}

async fn fetch_association(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    patient_id: Uuid,
    for_update: bool,
) -> CareResult<Option<DoctorPatientAssociation>> {
    let mut query = String::from(
        "SELECT doctor_id, patient_id, assigned_at, updated_at, status, note, \
         status_updated_at, status_updated_by, version \
         FROM fhr_care.doctor_patient_associations \
         WHERE doctor_id = $1 AND patient_id = $2",
    );
    if for_update {
        query.push_str(" FOR UPDATE");
    }

    let Some(row) = sqlx::query(&query)
        .bind(doctor_id)
        .bind(patient_id)
        .fetch_optional(conn)
        .await?
    else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    Ok(Some(DoctorPatientAssociation {
        doctor_id: row.try_get("doctor_id")?,
        patient_id: row.try_get("patient_id")?,
        assigned_at: row.try_get("assigned_at")?,
        updated_at: row.try_get("updated_at")?,
        status: status.parse()?,
        note: row.try_get("note")?,
        status_updated_at: row.try_get("status_updated_at")?,
        status_updated_by: row.try_get("status_updated_by")?,
        version: row.try_get("version")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn doctor() -> Actor {
        Actor::new(Uuid::new_v4(), Role::Doctor)
    }

    fn assigned(doctor: &Actor) -> DoctorPatientAssociation {
        new_association(
            doctor.user_id,
            Uuid::new_v4(),
            None,
            None,
            Utc::now() - Duration::days(10),
        )
    }

    fn update(status: CareStatus, notes: Option<&str>) -> StatusUpdate {
        StatusUpdate {
            status,
            notes: notes.map(str::to_string),
        }
    }

    /// Applies a planned transition the way the transaction does.
    fn apply(
        current: &mut DoctorPatientAssociation,
        audit: &mut Vec<PatientStatusHistory>,
        req: StatusUpdate,
        actor: &Actor,
    ) -> CareResult<()> {
        let transition = plan_status_update(current, &req, actor, Utc::now())?;
        *current = transition.association;
        audit.extend(transition.history);
        Ok(())
    }

    #[test]
    fn new_assignments_default_to_active() {
        let association = new_association(Uuid::new_v4(), Uuid::new_v4(), None, None, Utc::now());
        assert_eq!(association.status, CareStatus::Active);
        assert_eq!(association.version, 0);
        assert!(association.status_updated_by.is_none());
    }

    #[test]
    fn active_and_inactive_toggle_freely() {
        let actor = doctor();
        let mut association = assigned(&actor);
        let mut audit = Vec::new();
        apply(&mut association, &mut audit, update(CareStatus::Inactive, None), &actor).unwrap();
        apply(&mut association, &mut audit, update(CareStatus::Active, None), &actor).unwrap();
        assert_eq!(association.status, CareStatus::Active);
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].old_status, CareStatus::Active);
        assert_eq!(audit[0].new_status, CareStatus::Inactive);
        assert_eq!(audit[1].changed_by, actor.user_id);
    }

    #[test]
    fn discharge_is_terminal() {
        let actor = doctor();
        let mut association = assigned(&actor);
        let mut audit = Vec::new();
        let discharge = update(CareStatus::Discharged, Some("delivered"));
        apply(&mut association, &mut audit, discharge, &actor).unwrap();
        assert_eq!(audit.len(), 1);

        for target in [CareStatus::Active, CareStatus::Inactive] {
            let err =
                apply(&mut association, &mut audit, update(target, None), &actor).unwrap_err();
            assert!(matches!(
                err,
                CareError::InvalidStateTransition {
                    from: CareStatus::Discharged,
                    ..
                }
            ));
        }
        assert_eq!(association.status, CareStatus::Discharged);
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn repeated_discharge_is_a_silent_no_op() {
        let actor = doctor();
        let mut association = assigned(&actor);
        let mut audit = Vec::new();
        apply(&mut association, &mut audit, update(CareStatus::Discharged, None), &actor).unwrap();
        let before = association.updated_at;

        apply(&mut association, &mut audit, update(CareStatus::Discharged, None), &actor).unwrap();
        assert_eq!(audit.len(), 1);
        assert!(association.updated_at >= before);
        assert_eq!(association.version, 2);
    }

    #[test]
    fn notes_only_change_is_audited() {
        let actor = doctor();
        let mut association = assigned(&actor);
        let assigned_updated_at = association.updated_at;
        let mut audit = Vec::new();

        let weekly = update(CareStatus::Active, Some("weekly CTG"));
        apply(&mut association, &mut audit, weekly.clone(), &actor).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].old_status, CareStatus::Active);
        assert_eq!(audit[0].new_status, CareStatus::Active);
        assert_eq!(audit[0].notes.as_deref(), Some("weekly CTG"));
        assert_eq!(association.note.as_deref(), Some("weekly CTG"));
        assert!(association.updated_at > assigned_updated_at);

        // same notes again: nothing to audit, timestamp still refreshed
        apply(&mut association, &mut audit, weekly, &actor).unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn unchanged_update_refreshes_timestamp_only() {
        let actor = doctor();
        let current = assigned(&actor);
        let req = update(CareStatus::Active, None);
        let transition = plan_status_update(&current, &req, &actor, Utc::now()).unwrap();
        assert!(transition.history.is_none());
        assert!(transition.association.updated_at > current.updated_at);
        assert_eq!(transition.association.status_updated_by, None);
        assert_eq!(transition.association.note, current.note);
    }

    #[test]
    fn only_assigned_doctor_or_admin_may_update() {
        let owner = doctor();
        let current = assigned(&owner);
        let req = update(CareStatus::Inactive, None);

        let other_doctor = doctor();
        let err = plan_status_update(&current, &req, &other_doctor, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let patient = Actor::new(current.patient_id, Role::Patient);
        assert!(plan_status_update(&current, &req, &patient, Utc::now()).is_err());

        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        let transition = plan_status_update(&current, &req, &admin, Utc::now()).unwrap();
        assert_eq!(transition.association.status_updated_by, Some(admin.user_id));
    }

    #[test]
    fn assign_discharge_then_reactivate_fails() {
        let actor = doctor();
        let mut association = new_association(
            actor.user_id,
            Uuid::new_v4(),
            Some(CareStatus::Active),
            None,
            Utc::now(),
        );
        let mut audit = Vec::new();
        apply(&mut association, &mut audit, update(CareStatus::Discharged, None), &actor).unwrap();
        let err = apply(&mut association, &mut audit, update(CareStatus::Active, None), &actor)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state_transition");
    }

    #[test]
    fn status_request_rejects_unknown_values() {
        let ok: StatusUpdate = serde_json::from_str(r#"{"status":"inactive"}"#).unwrap();
        assert_eq!(ok, update(CareStatus::Inactive, None));
        assert!(serde_json::from_str::<StatusUpdate>(r#"{"status":"paused"}"#).is_err());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_assignment_is_rejected(pool: PgPool) {
        let doctor = Actor::new(db::insert_test_user(&pool, Role::Doctor).await, Role::Doctor);
        let patient = db::insert_test_user(&pool, Role::Patient).await;

        assign(&pool, doctor.user_id, patient, None, None, &doctor)
            .await
            .unwrap();
        let err = assign(&pool, doctor.user_id, patient, None, None, &doctor)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_assigned");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_updates_serialize_on_the_association(pool: PgPool) {
        let doctor = Actor::new(db::insert_test_user(&pool, Role::Doctor).await, Role::Doctor);
        let patient = db::insert_test_user(&pool, Role::Patient).await;
        let inactive = Some(CareStatus::Inactive);
        assign(&pool, doctor.user_id, patient, inactive, None, &doctor)
            .await
            .unwrap();

        let (discharged, activated) = tokio::join!(
            update_status(
                &pool,
                3,
                doctor.user_id,
                patient,
                update(CareStatus::Discharged, Some("delivered")),
                &doctor,
            ),
            update_status(
                &pool,
                3,
                doctor.user_id,
                patient,
                update(CareStatus::Active, None),
                &doctor,
            ),
        );
        discharged.unwrap();
        // Activation either lands first or hits the terminal state.
        let applied = match activated {
            Ok(_) => 2,
            Err(err) => {
                assert_eq!(err.kind(), "invalid_state_transition");
                1
            }
        };

        let mut conn = pool.acquire().await.unwrap();
        let current = fetch_association(&mut conn, doctor.user_id, patient, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.status, CareStatus::Discharged);
        assert_eq!(current.version, applied);

        let entries = history(&pool, doctor.user_id, patient, &doctor).await.unwrap();
        assert_eq!(entries.len() as i64, applied);
        assert_eq!(entries[0].old_status, CareStatus::Inactive);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].old_status, pair[0].new_status);
        }
        assert_eq!(entries.last().unwrap().new_status, CareStatus::Discharged);
    }
}
