use serde::{Serialize, Serializer};
use std::fmt;

/// Canonical store-side event category.
///
/// Serializes as its `Enum8` code so it can be written straight into a
/// ClickHouse `Enum8` column over RowBinary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum EventCategory {
    Unspecified = 0,
    ProcessStart = 1,
    ProcessTerminate = 2,
    FileAccess = 3,
    FileModify = 4,
    FileDelete = 5,
    NetworkConn = 6,
    RegistryModify = 7,
    DlpViolation = 8,
    Authentication = 9,
}

impl EventCategory {
    pub const ALL: [EventCategory; 10] = [
        EventCategory::Unspecified,
        EventCategory::ProcessStart,
        EventCategory::ProcessTerminate,
        EventCategory::FileAccess,
        EventCategory::FileModify,
        EventCategory::FileDelete,
        EventCategory::NetworkConn,
        EventCategory::RegistryModify,
        EventCategory::DlpViolation,
        EventCategory::Authentication,
    ];

    /// Maps an agent-side event type tag. Tags outside the table become
    /// [`EventCategory::Unspecified`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "PROCESS_START" => EventCategory::ProcessStart,
            "PROCESS_TERMINATE" => EventCategory::ProcessTerminate,
            "FILE_ACCESS" => EventCategory::FileAccess,
            "FILE_MODIFY" => EventCategory::FileModify,
            "FILE_DELETE" => EventCategory::FileDelete,
            "NETWORK_CONN" => EventCategory::NetworkConn,
            "REGISTRY_MODIFY" => EventCategory::RegistryModify,
            "DLP_VIOLATION" => EventCategory::DlpViolation,
            "AUTHENTICATION" => EventCategory::Authentication,
            _ => EventCategory::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Unspecified => "unspecified",
            EventCategory::ProcessStart => "process_start",
            EventCategory::ProcessTerminate => "process_terminate",
            EventCategory::FileAccess => "file_access",
            EventCategory::FileModify => "file_modify",
            EventCategory::FileDelete => "file_delete",
            EventCategory::NetworkConn => "network_conn",
            EventCategory::RegistryModify => "registry_modify",
            EventCategory::DlpViolation => "dlp_violation",
            EventCategory::Authentication => "authentication",
        }
    }

    pub fn code(self) -> i8 {
        self as i8
    }

    /// Column type for the category, e.g. `Enum8('unspecified' = 0, ...)`.
    pub fn enum8_definition() -> String {
        let variants = Self::ALL
            .iter()
            .map(|category| format!("'{}' = {}", category.as_str(), category.code()))
            .collect::<Vec<_>>();
        format!("Enum8({})", variants.join(", "))
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.code())
    }
}
