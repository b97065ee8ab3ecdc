//! Subject types and their physical collection mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Category of the data subject. Decides which physical collection serves a
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubjectType {
    Aad,
    Aad2,
    Msa,
    Device,
    NonWindowsDevice,
    Demographic,
    MicrosoftEmployee,
    EdgeBrowser,
}

impl SubjectType {
    pub const ALL: [SubjectType; 8] = [
        SubjectType::Aad,
        SubjectType::Aad2,
        SubjectType::Msa,
        SubjectType::Device,
        SubjectType::NonWindowsDevice,
        SubjectType::Demographic,
        SubjectType::MicrosoftEmployee,
        SubjectType::EdgeBrowser,
    ];

    /// Name of the document collection holding queues for this subject type.
    pub fn collection_id(self) -> &'static str {
        match self {
            SubjectType::Aad => "aadQueueCollection",
            SubjectType::Aad2 => "aad2QueueCollection",
            SubjectType::Msa => "msaQueueCollection",
            SubjectType::Device => "deviceQueueCollection",
            SubjectType::NonWindowsDevice => "nonWinDeviceQueueCollection",
            SubjectType::Demographic | SubjectType::MicrosoftEmployee => {
                "demographicQueueCollection"
            }
            SubjectType::EdgeBrowser => "edgeBrowserQueueCollection",
        }
    }

    /// Stable numeric code, embedded in cloud queue names.
    pub fn code(self) -> u8 {
        match self {
            SubjectType::Aad => 0,
            SubjectType::Msa => 1,
            SubjectType::Device => 2,
            SubjectType::Demographic => 3,
            SubjectType::MicrosoftEmployee => 4,
            SubjectType::EdgeBrowser => 5,
            SubjectType::NonWindowsDevice => 6,
            SubjectType::Aad2 => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::Aad => "Aad",
            SubjectType::Aad2 => "Aad2",
            SubjectType::Msa => "Msa",
            SubjectType::Device => "Device",
            SubjectType::NonWindowsDevice => "NonWindowsDevice",
            SubjectType::Demographic => "Demographic",
            SubjectType::MicrosoftEmployee => "MicrosoftEmployee",
            SubjectType::EdgeBrowser => "EdgeBrowser",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown subject type '{0}'")]
pub struct UnknownSubjectType(pub String);

impl FromStr for SubjectType {
    type Err = UnknownSubjectType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubjectType::ALL
            .into_iter()
            .find(|subject| subject.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownSubjectType(s.to_string()))
    }
}
