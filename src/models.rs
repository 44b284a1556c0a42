use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CareError;

/// Enum stored as lowercase text, with as_str + FromStr + Display.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = CareError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(CareError::InvalidInput(format!(
                        "unknown {} value: {:?}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Role {
    Patient => "patient",
    Doctor => "doctor",
    Admin => "admin",
});

str_enum!(RecordSource {
    Clinic => "clinic",
    SelfReported => "self",
});

str_enum!(PrimaryClassification {
    Normal => "normal",
    Bradycardia => "bradycardia",
    Tachycardia => "tachycardia",
    Irregular => "irregular",
});

str_enum!(OverallClassification {
    Normal => "normal",
    Concerning => "concerning",
    Abnormal => "abnormal",
});

str_enum!(RiskLevel {
    Low => "low",
    Medium => "medium",
    High => "high",
});

str_enum!(CareStatus {
    Active => "active",
    Inactive => "inactive",
    Discharged => "discharged",
});

str_enum!(NotificationStatus {
    Unread => "unread",
    Read => "read",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: Role,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the start of the session.
    pub time_offset: f64,
    pub bpm: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_quality: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub average_bpm: f64,
    pub baseline_variability: f64,
    pub primary_classification: PrimaryClassification,
    pub overall_classification: OverallClassification,
    pub risk_level: RiskLevel,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub source: RecordSource,
    pub samples: Vec<Sample>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub classification: String,
    pub result: Option<ClassificationResult>,
    pub notes: String,
    pub shared_with: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub from_patient: Uuid,
    pub to_doctor: Uuid,
    pub record_id: Uuid,
    pub message: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorPatientAssociation {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: CareStatus,
    pub note: Option<String>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub status_updated_by: Option<Uuid>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientStatusHistory {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub old_status: CareStatus,
    pub new_status: CareStatus,
    pub notes: Option<String>,
    pub changed_by: Uuid,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn care_status_round_trip() {
        for (variant, s) in [
            (CareStatus::Active, "active"),
            (CareStatus::Inactive, "inactive"),
            (CareStatus::Discharged, "discharged"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(CareStatus::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn self_source_uses_short_label() {
        assert_eq!(RecordSource::SelfReported.as_str(), "self");
        assert_eq!(
            serde_json::to_string(&RecordSource::SelfReported).unwrap(),
            "\"self\""
        );
    }

    #[test]
    fn unknown_status_is_invalid_input() {
        let err = CareStatus::from_str("archived").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn only_admin_role_is_admin() {
        let id = Uuid::new_v4();
        assert!(Actor::new(id, Role::Admin).is_admin());
        assert!(!Actor::new(id, Role::Doctor).is_admin());
    }
}
